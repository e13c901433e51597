use std::collections::HashMap;
use std::convert::TryFrom;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use folio_core::{
    DocumentBackend, DocumentInfo, DocumentProvider, MarkerHandle, PageRect, RenderImage,
    RenderRequest,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{instrument, warn};

const MARKER_COLOR: [u8; 3] = [255, 235, 0];
const MARKER_ALPHA: f32 = 0.35;

pub struct PdfiumProvider {
    pdfium: Arc<Pdfium>,
}

impl PdfiumProvider {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_build_hint() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumProvider {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", path))?;
        let info = build_document_info(&self.pdfium, &absolute)?;
        Ok(Arc::new(PdfiumDocument::new(
            Arc::clone(&self.pdfium),
            absolute,
            info,
        )))
    }
}

struct PdfiumDocument {
    // Declared before pdfium: struct fields drop in declaration order, so the
    // cached document closes before the bindings it borrows are released.
    document: Mutex<Option<PdfDocument<'static>>>,
    pdfium: Arc<Pdfium>,
    path: PathBuf,
    info: DocumentInfo,
    markers: Mutex<MarkerStore>,
    cache: Mutex<Option<RenderCacheEntry>>,
}

struct RenderCacheEntry {
    page_index: usize,
    scale: f32,
    revision: u64,
    image: RenderImage,
}

/// Highlight rectangles keyed by handle. Only committed markers are folded
/// into renders; the revision counter invalidates the render cache whenever
/// the visible set changes.
#[derive(Default)]
struct MarkerStore {
    next_id: u64,
    revision: u64,
    entries: HashMap<u64, Marker>,
}

struct Marker {
    page_index: usize,
    rect: PageRect,
    committed: bool,
}

impl MarkerStore {
    fn add(&mut self, page_index: usize, rect: PageRect) -> MarkerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.revision += 1;
        self.entries.insert(
            id,
            Marker {
                page_index,
                rect,
                committed: false,
            },
        );
        MarkerHandle(id)
    }

    fn remove(&mut self, handle: MarkerHandle) {
        if self.entries.remove(&handle.0).is_some() {
            self.revision += 1;
        }
    }

    fn commit_page(&mut self, page_index: usize) {
        let mut changed = false;
        for marker in self.entries.values_mut() {
            if marker.page_index == page_index && !marker.committed {
                marker.committed = true;
                changed = true;
            }
        }
        if changed {
            self.revision += 1;
        }
    }

    fn committed_rects(&self, page_index: usize) -> Vec<PageRect> {
        self.entries
            .values()
            .filter(|marker| marker.committed && marker.page_index == page_index)
            .map(|marker| marker.rect)
            .collect()
    }
}

impl PdfiumDocument {
    fn new(pdfium: Arc<Pdfium>, path: PathBuf, info: DocumentInfo) -> Self {
        Self {
            document: Mutex::new(None),
            pdfium,
            path,
            info,
            markers: Mutex::new(MarkerStore::default()),
            cache: Mutex::new(None),
        }
    }

    fn open_document(&self) -> Result<PdfDocument<'static>> {
        let document = self
            .pdfium
            .load_pdf_from_file(&self.path, None)
            .with_context(|| format!("failed to open {:?}", self.path))?;
        // SAFETY: the returned PdfDocument borrows the Pdfium bindings owned by
        // self.pdfium. It is stored in self.document, which is declared before
        // pdfium and therefore drops first, so the bindings outlive it.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_document<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        if guard.is_none() {
            let document = self.open_document()?;
            *guard = Some(document);
        }
        let document = guard.as_ref().expect("document must be loaded");
        f(document)
    }

    fn render_internal(
        &self,
        document: &PdfDocument<'_>,
        request: &RenderRequest,
    ) -> Result<RenderImage> {
        let page_index: PdfPageIndex = request
            .page_index
            .try_into()
            .map_err(|_| anyhow!("page {} is out of supported range", request.page_index))?;
        let page = document
            .pages()
            .get(page_index)
            .with_context(|| format!("page {} out of range", request.page_index))?;

        let config = PdfRenderConfig::new().scale_page_by_factor(request.scale.max(0.1));
        let bitmap = page
            .render_with_config(&config)
            .with_context(|| format!("failed to render page {}", request.page_index))?;
        let image = bitmap.as_image().to_rgba8();
        let pixels = image.into_raw();

        Ok(RenderImage {
            width: u32::try_from(bitmap.width()).unwrap_or_default(),
            height: u32::try_from(bitmap.height()).unwrap_or_default(),
            pixels,
        })
    }
}

impl DocumentBackend for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    #[instrument(skip(self))]
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        let (marker_rects, revision) = {
            let markers = self.markers.lock();
            (markers.committed_rects(request.page_index), markers.revision)
        };

        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.as_ref() {
                if entry.page_index == request.page_index
                    && (entry.scale - request.scale).abs() < f32::EPSILON
                    && entry.revision == revision
                {
                    return Ok(entry.image.clone());
                }
            }
        }

        let mut image = self.with_document(|document| self.render_internal(document, &request))?;
        for rect in marker_rects {
            fill_rect(&mut image, rect, MARKER_COLOR, MARKER_ALPHA);
        }

        let mut cache = self.cache.lock();
        *cache = Some(RenderCacheEntry {
            page_index: request.page_index,
            scale: request.scale,
            revision,
            image: image.clone(),
        });

        Ok(image)
    }

    fn search_page(&self, page_index: usize, query: &str, scale: f32) -> Result<Vec<PageRect>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        self.with_document(|document| {
            let index: PdfPageIndex = page_index
                .try_into()
                .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
            let page = document
                .pages()
                .get(index)
                .with_context(|| format!("page {} out of range", page_index))?;
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;

            let options = PdfSearchOptions::new();
            let search = text
                .search(query, &options)
                .with_context(|| format!("failed to perform search on page {}", page_index))?;

            let page_height = page.height().value;
            if page.width().value <= 0.0 || page_height <= 0.0 {
                return Ok(Vec::new());
            }

            let mut results = Vec::new();
            while let Some(segments) = search.find_next() {
                let mut combined: Option<PageRect> = None;
                for segment in segments.iter() {
                    let bounds = segment.bounds();
                    let rect = pixel_rect(
                        bounds.left().value,
                        bounds.top().value,
                        bounds.right().value,
                        bounds.bottom().value,
                        page_height,
                        scale,
                    );
                    combined = Some(match combined {
                        Some(existing) => union(existing, rect),
                        None => rect,
                    });
                }
                if let Some(rect) = combined {
                    if rect.width() > 0.0 && rect.height() > 0.0 {
                        results.push(rect);
                    }
                }
            }

            Ok(results)
        })
    }

    fn add_highlight(&self, page_index: usize, rect: PageRect) -> Result<MarkerHandle> {
        if page_index >= self.info.page_count {
            return Err(anyhow!("page {} out of range", page_index));
        }
        Ok(self.markers.lock().add(page_index, rect))
    }

    fn delete_marker(&self, handle: MarkerHandle) -> Result<()> {
        self.markers.lock().remove(handle);
        Ok(())
    }

    fn commit_markers(&self, page_index: usize) -> Result<()> {
        self.markers.lock().commit_page(page_index);
        Ok(())
    }
}

fn build_document_info(pdfium: &Pdfium, path: &Path) -> Result<DocumentInfo> {
    let document = pdfium
        .load_pdf_from_file(path, None)
        .with_context(|| format!("failed to open {:?}", path))?;
    let page_count = usize::try_from(document.pages().len()).unwrap_or_default();

    Ok(DocumentInfo {
        path: path.to_path_buf(),
        page_count,
    })
}

/// Converts PDF point coordinates (origin bottom-left, y up) into rendered
/// pixel coordinates (origin top-left, y down) at the given scale.
fn pixel_rect(
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
    page_height: f32,
    scale: f32,
) -> PageRect {
    PageRect {
        left: left * scale,
        top: (page_height - top) * scale,
        right: right * scale,
        bottom: (page_height - bottom) * scale,
    }
}

fn union(a: PageRect, b: PageRect) -> PageRect {
    PageRect {
        left: a.left.min(b.left),
        top: a.top.min(b.top),
        right: a.right.max(b.right),
        bottom: a.bottom.max(b.bottom),
    }
}

fn fill_rect(image: &mut RenderImage, rect: PageRect, color: [u8; 3], alpha: f32) {
    if image.width == 0 || image.height == 0 {
        return;
    }
    let left = rect.left.floor().clamp(0.0, image.width as f32) as u32;
    let right = rect.right.ceil().clamp(0.0, image.width as f32) as u32;
    let top = rect.top.floor().clamp(0.0, image.height as f32) as u32;
    let bottom = rect.bottom.ceil().clamp(0.0, image.height as f32) as u32;
    if left >= right || top >= bottom {
        return;
    }

    for y in top..bottom {
        for x in left..right {
            let idx = ((y * image.width + x) * 4) as usize;
            if idx + 3 < image.pixels.len() {
                blend_pixel(&mut image.pixels[idx..idx + 4], color, alpha);
            }
        }
    }
}

fn blend_pixel(pixel: &mut [u8], color: [u8; 3], alpha: f32) {
    for channel in 0..3 {
        let base = pixel[channel] as f32;
        let overlay = color[channel] as f32;
        pixel[channel] = (base * (1.0 - alpha) + overlay * alpha).round() as u8;
    }
    pixel[3] = 255;
}

fn bind_pdfium_from_build_hint() -> Option<Pdfium> {
    match option_env!("FOLIO_PDFIUM_LIBRARY_PATH") {
        Some(path) if !path.is_empty() => match Pdfium::bind_to_library(path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!(
                    "failed to load Pdfium from build-provided path {}: {}",
                    path, err
                );
                None
            }
        },
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");

    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn white_image(width: u32, height: u32) -> RenderImage {
        RenderImage {
            width,
            height,
            pixels: vec![255; (width * height * 4) as usize],
        }
    }

    fn rect(left: f32, top: f32, right: f32, bottom: f32) -> PageRect {
        PageRect {
            left,
            top,
            right,
            bottom,
        }
    }

    #[test]
    fn pixel_rect_flips_the_vertical_axis() {
        let rect = pixel_rect(10.0, 700.0, 60.0, 680.0, 800.0, 2.0);
        assert_eq!(rect.left, 20.0);
        assert_eq!(rect.right, 120.0);
        assert_eq!(rect.top, 200.0);
        assert_eq!(rect.bottom, 240.0);
        assert!(rect.top < rect.bottom);
    }

    #[test]
    fn union_covers_both_rects() {
        let merged = union(rect(10.0, 20.0, 30.0, 40.0), rect(5.0, 25.0, 50.0, 35.0));
        assert_eq!(merged.left, 5.0);
        assert_eq!(merged.top, 20.0);
        assert_eq!(merged.right, 50.0);
        assert_eq!(merged.bottom, 40.0);
    }

    #[test]
    fn fill_rect_blends_only_inside_the_rect() {
        let mut image = white_image(4, 4);
        fill_rect(
            &mut image,
            rect(1.0, 1.0, 3.0, 3.0),
            MARKER_COLOR,
            MARKER_ALPHA,
        );

        let inside = &image.pixels[(4 + 1) * 4..(4 + 1) * 4 + 4];
        assert_eq!(inside, [255, 248, 166, 255]);
        let outside = &image.pixels[0..4];
        assert_eq!(outside, [255, 255, 255, 255]);
    }

    #[test]
    fn fill_rect_clamps_to_the_image() {
        let mut image = white_image(2, 2);
        fill_rect(
            &mut image,
            rect(-5.0, -5.0, 50.0, 50.0),
            MARKER_COLOR,
            MARKER_ALPHA,
        );

        for pixel in image.pixels.chunks_exact(4) {
            assert_eq!(pixel, [255, 248, 166, 255]);
        }
    }

    #[test]
    fn marker_store_tracks_commits_and_revisions() {
        let mut store = MarkerStore::default();
        let first = store.add(0, rect(0.0, 0.0, 10.0, 10.0));
        let second = store.add(1, rect(0.0, 0.0, 10.0, 10.0));

        assert!(store.committed_rects(0).is_empty());
        store.commit_page(0);
        assert_eq!(store.committed_rects(0).len(), 1);
        assert!(store.committed_rects(1).is_empty());

        let before = store.revision;
        store.remove(first);
        assert!(store.revision > before);
        assert!(store.committed_rects(0).is_empty());

        let unchanged = store.revision;
        store.remove(first);
        assert_eq!(store.revision, unchanged);

        store.commit_page(1);
        assert_eq!(store.committed_rects(1).len(), 1);
        store.remove(second);
        assert!(store.committed_rects(1).is_empty());
    }
}
