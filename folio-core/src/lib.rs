use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Zoom applied to every rendered page, both axes.
pub const RENDER_ZOOM: f32 = 2.0;

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub path: PathBuf,
    pub page_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    pub page_index: usize,
    pub scale: f32,
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Axis-aligned rectangle in rendered-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl PageRect {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }
}

/// One word located by text detection, in bitmap pixels.
#[derive(Debug, Clone)]
pub struct DetectedWord {
    pub text: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Opaque identifier for a highlight marker held by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkerHandle(pub u64);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no document is open")]
    NoDocument,
    #[error("page {0} out of range")]
    OutOfRange(i64),
    #[error("invalid page number {0:?}")]
    InvalidPageNumber(String),
}

pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage>;
    /// Literal occurrences of `query` on one page, one rectangle per match,
    /// in rendered-pixel coordinates at the given scale.
    fn search_page(&self, page_index: usize, query: &str, scale: f32) -> Result<Vec<PageRect>>;
    fn add_highlight(&self, page_index: usize, rect: PageRect) -> Result<MarkerHandle>;
    fn delete_marker(&self, handle: MarkerHandle) -> Result<()>;
    /// Folds outstanding markers on a page into subsequent renders of it.
    fn commit_markers(&self, page_index: usize) -> Result<()>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>>;
}

pub trait TextDetector: Send + Sync {
    fn detect(&self, image: &RenderImage) -> Result<Vec<DetectedWord>>;
}

/// Renders pages at the fixed zoom, rejecting out-of-range indices. Holds no
/// bitmaps itself; backends are free to keep their own caches.
pub struct PageCache {
    backend: Arc<dyn DocumentBackend>,
    page_count: usize,
}

impl PageCache {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        let page_count = backend.info().page_count;
        Self {
            backend,
            page_count,
        }
    }

    pub fn render(&self, page_index: usize) -> Result<RenderImage> {
        if page_index >= self.page_count {
            return Err(EngineError::OutOfRange(page_index as i64).into());
        }
        self.backend.render_page(RenderRequest {
            page_index,
            scale: RENDER_ZOOM,
        })
    }
}

/// Lazy per-page index of recognized words. An entry is built at most once;
/// pages are immutable after open, so entries are never invalidated.
#[derive(Default)]
pub struct PageTextIndex {
    pages: HashMap<usize, HashMap<String, PageRect>>,
}

impl PageTextIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, page_index: usize) -> bool {
        self.pages.contains_key(&page_index)
    }

    pub fn indexed_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn regions(&self, page_index: usize) -> Option<&HashMap<String, PageRect>> {
        self.pages.get(&page_index)
    }

    /// Stores a page's detection result. Tokens that are empty after trimming
    /// are dropped; a repeated token keeps the box detected last.
    pub fn insert(&mut self, page_index: usize, words: Vec<DetectedWord>) {
        let mut regions = HashMap::new();
        for word in words {
            if word.text.trim().is_empty() {
                continue;
            }
            let rect = PageRect {
                left: word.x as f32,
                top: word.y as f32,
                right: (word.x + word.width) as f32,
                bottom: (word.y + word.height) as f32,
            };
            regions.insert(word.text, rect);
        }
        self.pages.insert(page_index, regions);
    }
}

#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub page_index: usize,
    pub rect: PageRect,
    pub marker: MarkerHandle,
}

/// Ordered matches for the active query plus the cyclic cursor.
#[derive(Debug, Default)]
pub struct SearchState {
    query: String,
    matches: Vec<SearchMatch>,
    current: Option<usize>,
}

impl SearchState {
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn matches(&self) -> &[SearchMatch] {
        &self.matches
    }

    pub fn total(&self) -> usize {
        self.matches.len()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&self) -> Option<&SearchMatch> {
        self.current.and_then(|index| self.matches.get(index))
    }

    fn clear(&mut self) {
        self.query.clear();
        self.matches.clear();
        self.current = None;
    }

    fn advance(&mut self) -> Option<usize> {
        if self.matches.is_empty() {
            return None;
        }
        let next = match self.current {
            None => 0,
            Some(index) => (index + 1) % self.matches.len(),
        };
        self.current = Some(next);
        self.current
    }

    fn retreat(&mut self) -> Option<usize> {
        if self.matches.is_empty() {
            return None;
        }
        let prev = match self.current {
            None | Some(0) => self.matches.len() - 1,
            Some(index) => index - 1,
        };
        self.current = Some(prev);
        self.current
    }
}

/// Vertical scroll position over the rendered page, clamped to [0, max].
#[derive(Debug, Clone, Copy, Default)]
pub struct Viewport {
    offset: f32,
    page_height: f32,
    view_height: f32,
}

impl Viewport {
    pub fn offset(&self) -> f32 {
        self.offset
    }

    pub fn max_offset(&self) -> f32 {
        (self.page_height - self.view_height).max(0.0)
    }

    pub fn page_height(&self) -> f32 {
        self.page_height
    }

    pub fn view_height(&self) -> f32 {
        self.view_height
    }

    fn clamp(&self, value: f32) -> f32 {
        value.clamp(0.0, self.max_offset())
    }

    fn set_page_height(&mut self, height: f32) {
        self.page_height = height.max(0.0);
        self.offset = self.clamp(self.offset);
    }

    fn set_view_height(&mut self, height: f32) {
        self.view_height = height.max(0.0);
        self.offset = self.clamp(self.offset);
    }
}

#[derive(Debug, Clone)]
pub struct SearchSummary {
    pub query: String,
    pub total: usize,
    pub current_index: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum Command {
    NextPage { count: usize },
    PrevPage { count: usize },
    GotoPage { page: usize },
    JumpToPage { input: String },
    ScrollBy { delta: f32 },
    Search { query: String },
    SearchNext { count: usize },
    SearchPrev { count: usize },
}

struct DocumentInstance {
    info: DocumentInfo,
    backend: Arc<dyn DocumentBackend>,
    cache: PageCache,
    text_index: PageTextIndex,
    current_page: usize,
    viewport: Viewport,
    in_transition: bool,
    search: SearchState,
}

enum SnapEdge {
    Top,
    Bottom,
}

pub struct Session {
    document: Option<DocumentInstance>,
    detector: Arc<dyn TextDetector>,
}

impl Session {
    pub fn new(detector: Arc<dyn TextDetector>) -> Self {
        Self {
            document: None,
            detector,
        }
    }

    pub fn has_document(&self) -> bool {
        self.document.is_some()
    }

    pub fn document_info(&self) -> Option<&DocumentInfo> {
        self.document.as_ref().map(|doc| &doc.info)
    }

    pub fn current_page(&self) -> Option<usize> {
        self.document.as_ref().map(|doc| doc.current_page)
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.document.as_ref().map(|doc| doc.viewport)
    }

    /// 1-based page display, e.g. "Page 3 of 120". A document with no pages
    /// has no page to describe.
    pub fn page_display(&self) -> Option<String> {
        let doc = self.document.as_ref()?;
        if doc.info.page_count == 0 {
            return None;
        }
        Some(format!(
            "Page {} of {}",
            doc.current_page + 1,
            doc.info.page_count
        ))
    }

    pub fn search_summary(&self) -> Option<SearchSummary> {
        let doc = self.document.as_ref()?;
        if doc.search.query.is_empty() {
            return None;
        }
        Some(SearchSummary {
            query: doc.search.query.clone(),
            total: doc.search.total(),
            current_index: doc.search.current_index(),
        })
    }

    pub fn current_match(&self) -> Option<&SearchMatch> {
        self.document.as_ref().and_then(|doc| doc.search.current())
    }

    pub fn render_current(&self) -> Result<RenderImage> {
        let doc = self.document.as_ref().ok_or(EngineError::NoDocument)?;
        doc.cache.render(doc.current_page)
    }

    #[instrument(skip(self, provider))]
    pub async fn open_with<P: DocumentProvider>(
        &mut self,
        provider: &P,
        path: PathBuf,
    ) -> Result<()> {
        let backend = provider.open(&path).await?;
        let info = backend.info().clone();
        let cache = PageCache::new(Arc::clone(&backend));
        self.document = Some(DocumentInstance {
            info,
            backend,
            cache,
            text_index: PageTextIndex::new(),
            current_page: 0,
            viewport: Viewport::default(),
            in_transition: false,
            search: SearchState::default(),
        });
        self.show_page(0);
        Ok(())
    }

    /// Anticipated failures degrade to logged no-ops; the event loop never
    /// sees an error from a command.
    pub fn apply(&mut self, command: Command) {
        match command {
            Command::NextPage { count } => {
                for _ in 0..count {
                    self.next_page();
                }
            }
            Command::PrevPage { count } => {
                for _ in 0..count {
                    self.prev_page();
                }
            }
            Command::GotoPage { page } => {
                self.show_page(page);
            }
            Command::JumpToPage { input } => {
                if let Err(err) = self.jump_to_page(&input) {
                    debug!(?err, %input, "page jump ignored");
                }
            }
            Command::ScrollBy { delta } => self.scroll_by(delta),
            Command::Search { query } => {
                if let Err(err) = self.search(&query) {
                    warn!(?err, "search failed");
                }
            }
            Command::SearchNext { count } => {
                for _ in 0..count {
                    self.next_match();
                }
            }
            Command::SearchPrev { count } => {
                for _ in 0..count {
                    self.prev_match();
                }
            }
        }
    }

    /// Displays page `page_index`. Returns false (and changes nothing beyond
    /// the committed page index) when there is no document, the index is out
    /// of range, or rendering fails.
    pub fn show_page(&mut self, page_index: usize) -> bool {
        match self.try_show_page(page_index) {
            Ok(()) => true,
            Err(err) => {
                debug!(?err, page = page_index, "page display skipped");
                false
            }
        }
    }

    fn try_show_page(&mut self, page_index: usize) -> Result<()> {
        let doc = self.document.as_mut().ok_or(EngineError::NoDocument)?;
        if page_index >= doc.info.page_count {
            return Err(EngineError::OutOfRange(page_index as i64).into());
        }
        doc.current_page = page_index;
        let image = doc.cache.render(page_index)?;
        doc.viewport.set_page_height(image.height as f32);
        if !doc.text_index.contains(page_index) {
            // Fire and forget: a failed detection caches nothing, so the next
            // display of this page retries.
            if let Err(err) = self.index_page(page_index, &image) {
                warn!(?err, page = page_index, "text detection failed");
            }
        }
        Ok(())
    }

    fn index_page(&mut self, page_index: usize, image: &RenderImage) -> Result<()> {
        let words = self.detector.detect(image)?;
        if let Some(doc) = self.document.as_mut() {
            doc.text_index.insert(page_index, words);
        }
        Ok(())
    }

    /// Token-to-box map for a page, built on first request and cached for the
    /// rest of the session.
    pub fn text_regions(&mut self, page_index: usize) -> Result<&HashMap<String, PageRect>> {
        let doc = self.document.as_ref().ok_or(EngineError::NoDocument)?;
        if page_index >= doc.info.page_count {
            return Err(EngineError::OutOfRange(page_index as i64).into());
        }
        if !doc.text_index.contains(page_index) {
            let image = doc.cache.render(page_index)?;
            self.index_page(page_index, &image)?;
        }
        let doc = self.document.as_ref().ok_or(EngineError::NoDocument)?;
        doc.text_index
            .regions(page_index)
            .ok_or_else(|| EngineError::OutOfRange(page_index as i64).into())
    }

    pub fn indexed_pages(&self) -> usize {
        self.document
            .as_ref()
            .map(|doc| doc.text_index.indexed_pages())
            .unwrap_or(0)
    }

    pub fn prev_page(&mut self) {
        self.with_manual_transition(|session| {
            let Some(target) = session
                .current_page()
                .and_then(|page| page.checked_sub(1))
            else {
                return;
            };
            if session.show_page(target) {
                session.snap_scroll(SnapEdge::Bottom);
            }
        });
    }

    pub fn next_page(&mut self) {
        self.with_manual_transition(|session| {
            let Some(target) = session.current_page().map(|page| page + 1) else {
                return;
            };
            if session.show_page(target) {
                session.snap_scroll(SnapEdge::Top);
            }
        });
    }

    /// Parses 1-based page input, e.g. from a page-number prompt. "0", text
    /// that is not an integer, and pages past the end are all rejected.
    pub fn jump_to_page(&mut self, input: &str) -> Result<()> {
        let doc = self.document.as_ref().ok_or(EngineError::NoDocument)?;
        let page_count = doc.info.page_count;
        let number: i64 = input
            .trim()
            .parse()
            .map_err(|_| EngineError::InvalidPageNumber(input.to_string()))?;
        let target = number - 1;
        if target < 0 || target as usize >= page_count {
            return Err(EngineError::OutOfRange(target).into());
        }
        self.show_page(target as usize);
        Ok(())
    }

    pub fn scroll_by(&mut self, delta: f32) {
        let Some(current) = self.document.as_ref().map(|doc| doc.viewport.offset) else {
            return;
        };
        self.set_scroll(current + delta);
    }

    /// Stores a clamped scroll position and, when the value actually changed,
    /// runs the page-edge check.
    pub fn set_scroll(&mut self, value: f32) {
        let Some(doc) = self.document.as_mut() else {
            return;
        };
        let clamped = doc.viewport.clamp(value);
        if clamped == doc.viewport.offset {
            return;
        }
        doc.viewport.offset = clamped;
        self.on_scroll_changed(clamped);
    }

    pub fn set_view_height(&mut self, height: f32) {
        // Resizing clamps silently; pagination reacts to scroll input only.
        if let Some(doc) = self.document.as_mut() {
            doc.viewport.set_view_height(height);
        }
    }

    fn on_scroll_changed(&mut self, value: f32) {
        let Some(doc) = self.document.as_ref() else {
            return;
        };
        if doc.in_transition {
            return;
        }
        // clamp() lands exactly on the bounds, so equality is exact here.
        let max = doc.viewport.max_offset();
        let page = doc.current_page;
        let page_count = doc.info.page_count;
        if value == 0.0 && page > 0 {
            self.prev_page();
        } else if value == max && page + 1 < page_count {
            self.next_page();
        }
    }

    #[instrument(skip(self))]
    pub fn search(&mut self, query: &str) -> Result<()> {
        self.clear_search_markers()?;

        if query.trim().is_empty() {
            let current = self.current_page().unwrap_or(0);
            if let Some(doc) = self.document.as_mut() {
                doc.search.clear();
            }
            self.show_page(current);
            return Ok(());
        }

        let doc = self.document.as_mut().ok_or(EngineError::NoDocument)?;
        let backend = Arc::clone(&doc.backend);
        let page_count = doc.info.page_count;
        doc.search.query = query.to_string();
        doc.search.current = None;

        // Each match is tracked the moment its marker exists; a scan aborted
        // by a backend error leaves no marker the next clear pass cannot
        // reclaim.
        for page_index in 0..page_count {
            let rects = backend.search_page(page_index, query, RENDER_ZOOM)?;
            for rect in rects {
                let marker = backend.add_highlight(page_index, rect)?;
                doc.search.matches.push(SearchMatch {
                    page_index,
                    rect,
                    marker,
                });
            }
            backend.commit_markers(page_index)?;
        }

        if !doc.search.matches.is_empty() {
            self.next_match();
        }
        Ok(())
    }

    fn clear_search_markers(&mut self) -> Result<()> {
        let doc = self.document.as_mut().ok_or(EngineError::NoDocument)?;
        let backend = Arc::clone(&doc.backend);
        for stale in doc.search.matches.drain(..) {
            if let Err(err) = backend.delete_marker(stale.marker) {
                warn!(?err, "failed to delete stale highlight marker");
            }
        }
        doc.search.current = None;
        Ok(())
    }

    pub fn next_match(&mut self) {
        let moved = match self.document.as_mut() {
            Some(doc) => doc.search.advance(),
            None => None,
        };
        if moved.is_some() {
            self.show_current_match();
        }
    }

    pub fn prev_match(&mut self) {
        let moved = match self.document.as_mut() {
            Some(doc) => doc.search.retreat(),
            None => None,
        };
        if moved.is_some() {
            self.show_current_match();
        }
    }

    fn show_current_match(&mut self) {
        let Some((page_index, top)) = self
            .document
            .as_ref()
            .and_then(|doc| doc.search.current())
            .map(|m| (m.page_index, m.rect.top))
        else {
            return;
        };
        self.with_manual_transition(|session| {
            if session.show_page(page_index) {
                session.set_scroll(top);
            }
        });
    }

    fn snap_scroll(&mut self, edge: SnapEdge) {
        let Some(doc) = self.document.as_ref() else {
            return;
        };
        let target = match edge {
            SnapEdge::Top => 0.0,
            SnapEdge::Bottom => doc.viewport.max_offset(),
        };
        self.set_scroll(target);
    }

    fn with_manual_transition<F: FnOnce(&mut Self)>(&mut self, f: F) {
        if let Some(doc) = self.document.as_mut() {
            doc.in_transition = true;
        }
        f(self);
        if let Some(doc) = self.document.as_mut() {
            doc.in_transition = false;
        }
    }
}
