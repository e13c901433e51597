use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, DisableMouseCapture, EnableMouseCapture};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use folio_core::{Command, RenderImage, Session, TextDetector};
use folio_ocr::{NoopDetector, TesseractDetector};
use folio_render::PdfiumProvider;
use folio_tty::{write_status_line, DrawParams, EventMapper, KittyRenderer, UiEvent};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "folio",
    version,
    about = "kitty-native paginated document viewer with searchable OCR text"
)]
struct Args {
    /// Path to the PDF file to open
    #[arg(required = true)]
    file: PathBuf,

    /// Page to open the document on (0-based)
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,

    /// Language passed to tesseract for text detection
    #[arg(long = "ocr-lang", default_value = "eng")]
    ocr_lang: String,

    /// Disable text detection entirely
    #[arg(long = "no-ocr")]
    no_ocr: bool,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        crossterm::execute!(stdout, EnableMouseCapture)?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show, DisableMouseCapture);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "folio", "folio")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let detector = build_detector(&args);
    let mut session = Session::new(detector);

    let provider = PdfiumProvider::new()?;
    session
        .open_with(&provider, args.file.clone())
        .await
        .with_context(|| format!("failed to open {:?}", args.file))?;

    if let Some(page) = args.page {
        session.apply(Command::GotoPage { page });
    }

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let mut renderer = KittyRenderer::new(stdout);
    let mut event_mapper = EventMapper::new();
    let mut dirty = true;

    loop {
        if dirty {
            let pending = event_mapper.pending_input();
            renderer.begin_sync_update()?;
            renderer.clear_all()?;
            redraw(&mut renderer, &mut session, pending.as_deref())?;
            renderer.end_sync_update()?;
            dirty = false;
        }

        if event::poll(Duration::from_millis(100))? {
            let ev = event::read()?;
            let ui_event = event_mapper.map_event(ev);
            let pending = event_mapper.pending_input();
            if let Some(status) = combine_status(document_status(&session), pending.as_deref()) {
                draw_status_line(&mut renderer, &status)?;
            }
            match handle_event(ui_event, &mut session) {
                LoopAction::ContinueRedraw => dirty = true,
                LoopAction::Continue => {}
                LoopAction::Quit => break,
            }
        }
    }

    renderer.clear_all()?;

    Ok(())
}

fn build_detector(args: &Args) -> Arc<dyn TextDetector> {
    if args.no_ocr {
        return Arc::new(NoopDetector);
    }
    if !TesseractDetector::is_available() {
        warn!("tesseract binary not found; text detection is disabled");
        return Arc::new(NoopDetector);
    }
    Arc::new(TesseractDetector::new(args.ocr_lang.clone()))
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

fn handle_event(event: UiEvent, session: &mut Session) -> LoopAction {
    match event {
        UiEvent::BeginSearch
        | UiEvent::SearchQueryChanged { .. }
        | UiEvent::BeginPageJump
        | UiEvent::PageJumpChanged { .. } => LoopAction::Continue,
        UiEvent::SearchSubmit { query } => {
            session.apply(Command::Search { query });
            LoopAction::ContinueRedraw
        }
        // Leaving a prompt keeps the previous results; only an empty
        // submitted query clears them.
        UiEvent::SearchCancel | UiEvent::PageJumpCancel => LoopAction::ContinueRedraw,
        UiEvent::PageJumpSubmit { input } => {
            session.apply(Command::JumpToPage { input });
            LoopAction::ContinueRedraw
        }
        UiEvent::Command(cmd) => {
            session.apply(cmd);
            LoopAction::ContinueRedraw
        }
        UiEvent::Quit => LoopAction::Quit,
        UiEvent::None => LoopAction::Continue,
    }
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    session: &mut Session,
    pending_input: Option<&str>,
) -> Result<()> {
    let window = terminal::window_size()?;
    let total_cols = u32::from(window.columns).max(1);
    let total_rows = u32::from(window.rows).max(1);
    let pixel_width = u32::from(window.width);
    let pixel_height = u32::from(window.height);
    let image_rows_available = total_rows.saturating_sub(1).max(1);

    if !session.has_document() {
        return Ok(());
    }

    let margin_cols = total_cols.min(2);
    let margin_rows = image_rows_available.min(2);
    let available_cols = total_cols.saturating_sub(margin_cols).max(1);
    let available_rows = image_rows_available.saturating_sub(margin_rows).max(1);

    let image = match session.render_current() {
        Ok(image) => image,
        Err(err) => {
            warn!(?err, "failed to render current page");
            return Ok(());
        }
    };

    let view_height = visible_page_height(
        &image,
        available_cols,
        available_rows,
        total_cols,
        total_rows,
        pixel_width,
        pixel_height,
    );
    session.set_view_height(view_height);
    let offset = session.viewport().map(|v| v.offset()).unwrap_or(0.0);
    let slice = crop_rows(&image, offset.max(0.0) as u32, view_height.ceil() as u32);

    let (draw_cols, draw_rows) = compute_scaled_dimensions(
        &slice,
        available_cols,
        available_rows,
        total_cols,
        total_rows,
        pixel_width,
        pixel_height,
    );

    let start_col = (total_cols.saturating_sub(draw_cols)) / 2;
    let start_row = (image_rows_available.saturating_sub(draw_rows)) / 2;

    {
        let mut writer = renderer.writer();
        crossterm::execute!(
            &mut writer,
            cursor::MoveTo(start_col as u16, start_row as u16)
        )?;
    }

    renderer.draw(&slice, DrawParams::clamped(draw_cols, draw_rows))?;

    if let Some(status) = combine_status(document_status(session), pending_input) {
        draw_status_line(renderer, &status)?;
    }

    Ok(())
}

fn document_status(session: &Session) -> Option<String> {
    let info = session.document_info()?;
    let mut status = info
        .path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("<unknown>")
        .to_string();

    if let Some(pages) = session.page_display() {
        status.push_str(" — ");
        status.push_str(&pages);
    }

    if let Some(summary) = session.search_summary() {
        status.push_str(" — /");
        status.push_str(&summary.query);
        if summary.total == 0 {
            status.push_str(" (no matches)");
        } else if let Some(index) = summary.current_index {
            status.push_str(&format!(" ({}/{})", index + 1, summary.total));
        } else {
            status.push_str(&format!(" (0/{})", summary.total));
        }
    }

    Some(status)
}

fn combine_status(base: Option<String>, pending_input: Option<&str>) -> Option<String> {
    match (base, pending_input.filter(|s| !s.is_empty())) {
        (Some(mut base), Some(pending)) => {
            base.push_str(" | ");
            base.push_str(pending);
            Some(base)
        }
        (Some(base), None) => Some(base),
        (None, Some(pending)) => Some(pending.to_string()),
        (None, None) => None,
    }
}

fn draw_status_line(renderer: &mut KittyRenderer<io::Stdout>, status: &str) -> Result<()> {
    let window = terminal::window_size()?;
    let total_rows = u32::from(window.rows).max(1);
    let status_row = total_rows.saturating_sub(1);
    let mut writer = renderer.writer();
    crossterm::execute!(
        &mut writer,
        cursor::MoveTo(0, status_row as u16),
        Clear(ClearType::CurrentLine)
    )?;
    write_status_line(&mut writer, status)?;
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "folio.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

/// Page pixels that fit in the drawable cell grid when the page is laid out
/// across the available columns.
fn visible_page_height(
    image: &RenderImage,
    available_cols: u32,
    available_rows: u32,
    total_cols: u32,
    total_rows: u32,
    pixel_width: u32,
    pixel_height: u32,
) -> f32 {
    if image.width == 0 || image.height == 0 || available_cols == 0 || available_rows == 0 {
        return image.height as f32;
    }

    let cell_width = if pixel_width > 0 && total_cols > 0 {
        pixel_width as f32 / total_cols as f32
    } else {
        0.0
    };
    let cell_height = if pixel_height > 0 && total_rows > 0 {
        pixel_height as f32 / total_rows as f32
    } else {
        0.0
    };

    let height = if cell_width > 0.0 && cell_height > 0.0 {
        let scale = (available_cols as f32 * cell_width) / image.width as f32;
        if scale > 0.0 {
            (available_rows as f32 * cell_height) / scale
        } else {
            image.height as f32
        }
    } else {
        // Without pixel metrics, assume cells are twice as tall as wide.
        image.width as f32 * 2.0 * available_rows as f32 / available_cols as f32
    };

    height.min(image.height as f32).max(1.0)
}

fn crop_rows(image: &RenderImage, origin_y: u32, height: u32) -> RenderImage {
    if image.width == 0 || image.height == 0 {
        return RenderImage {
            width: 0,
            height: 0,
            pixels: Vec::new(),
        };
    }

    let height = height.min(image.height).max(1);
    let origin_y = origin_y.min(image.height.saturating_sub(height));
    let stride = image.width as usize * 4;
    let start = origin_y as usize * stride;
    let end = start + height as usize * stride;

    RenderImage {
        width: image.width,
        height,
        pixels: image.pixels[start..end].to_vec(),
    }
}

fn compute_scaled_dimensions(
    image: &RenderImage,
    available_cols: u32,
    available_rows: u32,
    total_cols: u32,
    total_rows: u32,
    pixel_width: u32,
    pixel_height: u32,
) -> (u32, u32) {
    let draw_cols = available_cols.max(1);
    let mut draw_rows = available_rows.max(1);

    if image.width == 0 || image.height == 0 {
        return (draw_cols, draw_rows);
    }

    if pixel_width > 0 && pixel_height > 0 && total_cols > 0 && total_rows > 0 {
        let cell_width = pixel_width as f32 / total_cols as f32;
        let cell_height = pixel_height as f32 / total_rows as f32;

        if cell_width > 0.0 && cell_height > 0.0 {
            let scale = (draw_cols as f32 * cell_width) / image.width as f32;
            let rows = (image.height as f32 * scale / cell_height).round().max(1.0);
            draw_rows = rows.min(available_rows as f32) as u32;
        }
    } else {
        let ratio = image.width as f32 / image.height as f32;
        if ratio.is_finite() && ratio > 0.0 {
            let rows = (draw_cols as f32 / ratio / 2.0).round().max(1.0);
            draw_rows = rows.min(available_rows as f32) as u32;
        }
    }

    (draw_cols, draw_rows.max(1))
}
