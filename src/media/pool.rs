//! Sliding-window pool of media decoder controllers.
//!
//! The pool owns one decoder handle per initialized list index and keeps
//! only the window `[active - keep_behind, active + keep_ahead]` alive.
//! Exclusive playback is enforced by re-applying a pause sweep before any
//! slot starts playing, so at most one slot is ever `Playing`.
//!
//! Per-slot failures during batch operations (pause-all, window trimming,
//! preload) are logged and never abort the batch. Disposal errors are
//! swallowed: the slot is removed from the pool regardless.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::media::source::{MediaError, MediaHandle, MediaItem, MediaSource, ThumbnailFetcher};

/// Lifecycle of an initialized slot. Uninitialized and disposed slots are
/// simply absent from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Ready,
    Playing,
    Paused,
}

struct ControllerSlot {
    handle: Box<dyn MediaHandle>,
    state: SlotState,
    muted: bool,
}

impl ControllerSlot {
    fn is_playing(&self) -> bool {
        self.state == SlotState::Playing || self.handle.status().playing
    }
}

/// Read-only view of one slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotSnapshot {
    pub index: usize,
    pub state: SlotState,
    pub muted: bool,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    SlotCreated { index: usize },
    SlotDisposed { index: usize },
    ActiveChanged { from: usize, to: usize },
    Playing { index: usize },
    Paused { index: usize },
    PreloadFailed { index: usize, error: String },
}

/// Result of [`ControllerPool::preload_around`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadReport {
    pub initialized: Vec<usize>,
    pub failed: Vec<usize>,
    pub thumbnails: usize,
}

pub struct ControllerPool {
    config: PoolConfig,
    source: Arc<dyn MediaSource>,
    thumbnail_fetcher: Arc<dyn ThumbnailFetcher>,
    items: Vec<MediaItem>,
    slots: BTreeMap<usize, ControllerSlot>,
    active: usize,
    thumbnails: LruCache<String, Bytes>,
    events: broadcast::Sender<PoolEvent>,
}

/// Open and initialize a decoder for `item`. A handle whose initialization
/// fails is disposed before the error is returned.
async fn open_controller(
    source: &dyn MediaSource,
    item: &MediaItem,
) -> Result<Box<dyn MediaHandle>, MediaError> {
    let url = item.manifest_url().ok_or_else(|| MediaError::MissingManifest {
        id: item.id.clone(),
    })?;

    let mut handle = source.open(url).await.map_err(into_init)?;
    if let Err(e) = handle.initialize().await {
        if let Err(dispose_err) = handle.dispose().await {
            debug!(id = %item.id, "Dispose after failed init also failed: {dispose_err}");
        }
        return Err(into_init(e));
    }
    // Slots start muted; only play_active_video unmutes.
    if let Err(e) = handle.set_volume(0.0).await {
        if let Err(dispose_err) = handle.dispose().await {
            debug!(id = %item.id, "Dispose after failed mute also failed: {dispose_err}");
        }
        return Err(into_init(e));
    }
    Ok(handle)
}

fn into_init(e: MediaError) -> MediaError {
    match e {
        MediaError::Init(_) | MediaError::MissingManifest { .. } => e,
        other => MediaError::Init(other.to_string()),
    }
}

impl ControllerPool {
    pub fn new(
        config: PoolConfig,
        source: Arc<dyn MediaSource>,
        thumbnail_fetcher: Arc<dyn ThumbnailFetcher>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.thumbnail_capacity).unwrap_or(NonZeroUsize::MIN);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            source,
            thumbnail_fetcher,
            items: Vec::new(),
            slots: BTreeMap::new(),
            active: 0,
            thumbnails: LruCache::new(capacity),
            events,
        }
    }

    // ─── Playlist ───────────────────────────────────────────────────────

    /// Replace the playlist. Every slot is disposed and the active index
    /// resets to 0.
    pub async fn set_items(&mut self, items: Vec<MediaItem>) {
        self.dispose_all().await;
        self.items = items;
        self.active = 0;
    }

    /// Extend the playlist (pagination). Existing slots stay as they are.
    pub fn append_items(&mut self, items: impl IntoIterator<Item = MediaItem>) {
        self.items.extend(items);
    }

    pub fn items(&self) -> &[MediaItem] {
        &self.items
    }

    // ─── Slot lifecycle ─────────────────────────────────────────────────

    /// Create a ready, muted slot for `index`. A no-op if the slot exists.
    pub async fn init_controller(&mut self, index: usize) -> Result<(), MediaError> {
        if self.slots.contains_key(&index) {
            return Ok(());
        }
        let item = self.item(index)?.clone();
        let handle = open_controller(self.source.as_ref(), &item).await?;
        self.insert_slot(index, handle);
        Ok(())
    }

    fn insert_slot(&mut self, index: usize, handle: Box<dyn MediaHandle>) {
        self.slots.insert(
            index,
            ControllerSlot {
                handle,
                state: SlotState::Ready,
                muted: true,
            },
        );
        debug!(index, slots = self.slots.len(), "Controller initialized");
        self.emit(PoolEvent::SlotCreated { index });
    }

    fn item(&self, index: usize) -> Result<&MediaItem, MediaError> {
        self.items.get(index).ok_or(MediaError::IndexOutOfRange {
            index,
            len: self.items.len(),
        })
    }

    /// Make `index` the active page.
    ///
    /// Every playing slot is paused and muted first. The new active slot is
    /// initialized if needed and left muted. The window is trimmed even when
    /// readying the new slot fails; that failure is returned afterwards.
    pub async fn set_active_page(&mut self, index: usize) -> Result<(), MediaError> {
        self.item(index)?;

        self.pause_all_playing().await;
        let previous = self.active;
        self.active = index;
        if previous != index {
            info!(from = previous, to = index, "Active page changed");
            self.emit(PoolEvent::ActiveChanged {
                from: previous,
                to: index,
            });
        }

        let readied = self.ready_active().await;
        self.optimize_controllers().await;
        readied
    }

    /// The indices kept alive around the active page.
    pub fn window(&self) -> RangeInclusive<usize> {
        self.active.saturating_sub(self.config.keep_behind)..=self.active + self.config.keep_ahead
    }

    /// Dispose every slot outside the window. Returns the disposed indices.
    pub async fn optimize_controllers(&mut self) -> Vec<usize> {
        let window = self.window();
        let doomed: Vec<usize> = self
            .slots
            .keys()
            .copied()
            .filter(|index| !window.contains(index))
            .collect();

        for &index in &doomed {
            if let Some(slot) = self.slots.remove(&index) {
                self.dispose_slot(index, slot).await;
            }
        }
        if !doomed.is_empty() {
            debug!(
                active = self.active,
                disposed = doomed.len(),
                kept = self.slots.len(),
                "Controller window trimmed"
            );
        }
        doomed
    }

    /// Start the active slot, pausing and muting every other playing slot
    /// first. At most one slot is playing when this returns.
    pub async fn play_active_video(&mut self) -> Result<(), MediaError> {
        let active = self.active;
        self.pause_playing_except(Some(active)).await;

        if !self.slots.contains_key(&active) {
            self.init_controller(active).await?;
        }
        let volume = self.config.playback_volume;
        let Some(slot) = self.slots.get_mut(&active) else {
            return Err(MediaError::IndexOutOfRange {
                index: active,
                len: self.items.len(),
            });
        };

        slot.handle.set_volume(volume).await?;
        slot.muted = volume == 0.0;
        slot.handle.play().await?;
        slot.state = SlotState::Playing;
        debug!(index = active, "Playing");
        self.emit(PoolEvent::Playing { index: active });
        Ok(())
    }

    /// Initialize slots within `preload_radius` of `index` in parallel and
    /// prefetch their thumbnails. Failures are logged and reported, never
    /// returned.
    pub async fn preload_around(&mut self, index: usize) -> PreloadReport {
        if index >= self.items.len() {
            return PreloadReport::default();
        }
        let radius = self.config.preload_radius;
        let lo = index.saturating_sub(radius);
        let hi = index.saturating_add(radius).min(self.items.len() - 1);
        let neighbours: Vec<usize> = (lo..=hi)
            .filter(|&i| i != index && i < self.items.len())
            .collect();

        let mut report = PreloadReport::default();

        let to_open: Vec<(usize, MediaItem)> = neighbours
            .iter()
            .filter(|i| !self.slots.contains_key(i))
            .map(|&i| (i, self.items[i].clone()))
            .collect();
        let source = self.source.clone();
        let opened = join_all(to_open.iter().map(|(i, item)| {
            let source = source.clone();
            async move { (*i, open_controller(source.as_ref(), item).await) }
        }))
        .await;

        for (i, result) in opened {
            match result {
                Ok(handle) => {
                    self.insert_slot(i, handle);
                    report.initialized.push(i);
                }
                Err(e) => {
                    warn!(index = i, "Preload failed: {e}");
                    self.emit(PoolEvent::PreloadFailed {
                        index: i,
                        error: e.to_string(),
                    });
                    report.failed.push(i);
                }
            }
        }

        report.thumbnails = self.prefetch_thumbnails(&neighbours).await;
        debug!(
            index,
            initialized = report.initialized.len(),
            failed = report.failed.len(),
            thumbnails = report.thumbnails,
            "Preload complete"
        );
        report
    }

    async fn prefetch_thumbnails(&mut self, indices: &[usize]) -> usize {
        let urls: Vec<String> = indices
            .iter()
            .filter_map(|&i| self.items.get(i)?.thumbnail_url.clone())
            .filter(|url| !self.thumbnails.contains(url))
            .collect();

        let fetcher = self.thumbnail_fetcher.clone();
        let fetched = join_all(urls.into_iter().map(|url| {
            let fetcher = fetcher.clone();
            async move {
                let result = fetcher.fetch(&url).await;
                (url, result)
            }
        }))
        .await;

        let mut stored = 0;
        for (url, result) in fetched {
            match result {
                Ok(bytes) => {
                    self.thumbnails.put(url, bytes);
                    stored += 1;
                }
                Err(e) => debug!(url = %url, "Thumbnail prefetch failed: {e}"),
            }
        }
        stored
    }

    /// A cached thumbnail for `url`.
    pub fn thumbnail(&mut self, url: &str) -> Option<Bytes> {
        self.thumbnails.get(url).cloned()
    }

    /// The feed went out of view: pause and mute everything.
    pub async fn handle_video_invisible(&mut self) {
        for (&index, slot) in self.slots.iter_mut() {
            pause_and_mute(index, slot).await;
        }
        debug!(slots = self.slots.len(), "Feed hidden, all controllers paused");
    }

    /// The feed came back into view: ready the active slot but keep it
    /// muted and paused until an explicit play.
    pub async fn handle_video_visible(&mut self) -> Result<(), MediaError> {
        self.ready_active().await
    }

    /// Seek the active slot.
    pub async fn seek_active(&mut self, position: Duration) -> Result<(), MediaError> {
        let active = self.active;
        match self.slots.get_mut(&active) {
            Some(slot) => slot.handle.seek_to(position).await,
            None => Err(MediaError::Playback(format!("no controller for index {active}"))),
        }
    }

    /// Dispose every slot.
    pub async fn shutdown(&mut self) {
        let n = self.dispose_all().await;
        info!(disposed = n, "Controller pool shut down");
    }

    // ─── Introspection ──────────────────────────────────────────────────

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn slot_indices(&self) -> Vec<usize> {
        self.slots.keys().copied().collect()
    }

    pub fn playing_count(&self) -> usize {
        self.slots.values().filter(|s| s.is_playing()).count()
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.slots
            .iter()
            .map(|(&index, slot)| SlotSnapshot {
                index,
                state: slot.state,
                muted: slot.muted,
                active: index == self.active,
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    // ─── Internals ──────────────────────────────────────────────────────

    async fn ready_active(&mut self) -> Result<(), MediaError> {
        let active = self.active;
        self.init_controller(active).await?;
        if let Some(slot) = self.slots.get_mut(&active) {
            if slot.is_playing() {
                pause_and_mute(active, slot).await;
            } else if !slot.muted {
                if let Err(e) = slot.handle.set_volume(0.0).await {
                    warn!(index = active, "Mute failed: {e}");
                } else {
                    slot.muted = true;
                }
            }
        }
        Ok(())
    }

    async fn pause_all_playing(&mut self) {
        self.pause_playing_except(None).await;
    }

    async fn pause_playing_except(&mut self, keep: Option<usize>) {
        let mut paused = Vec::new();
        for (&index, slot) in self.slots.iter_mut() {
            if Some(index) == keep || !slot.is_playing() {
                continue;
            }
            pause_and_mute(index, slot).await;
            paused.push(index);
        }
        for index in paused {
            self.emit(PoolEvent::Paused { index });
        }
    }

    async fn dispose_slot(&self, index: usize, mut slot: ControllerSlot) {
        pause_and_mute(index, &mut slot).await;
        if let Err(e) = slot.handle.dispose().await {
            warn!(index, "Dispose failed, dropping controller anyway: {e}");
        }
        debug!(index, "Controller disposed");
        self.emit(PoolEvent::SlotDisposed { index });
    }

    async fn dispose_all(&mut self) -> usize {
        let slots = std::mem::take(&mut self.slots);
        let n = slots.len();
        for (index, slot) in slots {
            self.dispose_slot(index, slot).await;
        }
        n
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }
}

/// Pause (if playing) and mute one slot. Errors are logged; the slot is
/// marked paused and muted regardless.
async fn pause_and_mute(index: usize, slot: &mut ControllerSlot) {
    if slot.is_playing() {
        if let Err(e) = slot.handle.pause().await {
            warn!(index, "Pause failed: {e}");
        }
        slot.state = SlotState::Paused;
    }
    if let Err(e) = slot.handle.set_volume(0.0).await {
        warn!(index, "Mute failed: {e}");
    }
    slot.muted = true;
}
