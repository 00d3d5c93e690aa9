use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::db::LikedPaths;
use crate::errors::LikeError;
use crate::waline_client::LikeService;

/// What an article view renders for its like button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLikeState {
    pub count: u64,
    pub liked: bool,
    pub submitting: bool,
    /// True until the first hydration settles.
    pub loading: bool,
}

impl Default for ClientLikeState {
    fn default() -> Self {
        Self {
            count: 0,
            liked: false,
            submitting: false,
            loading: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleSnapshot {
    pub count: u64,
    pub liked: bool,
}

impl ClientLikeState {
    /// Applies the optimistic flip and enters `submitting`. Returns `None`
    /// when a toggle is already in flight.
    pub fn begin_toggle(&mut self) -> Option<ToggleSnapshot> {
        if self.submitting {
            return None;
        }
        let snapshot = ToggleSnapshot {
            count: self.count,
            liked: self.liked,
        };
        self.liked = !self.liked;
        self.count = if self.liked {
            self.count + 1
        } else {
            self.count.saturating_sub(1)
        };
        self.submitting = true;
        Some(snapshot)
    }

    /// Takes the server's count; the optimistic `liked` stands.
    pub fn commit(&mut self, count: u64) {
        self.count = count;
        self.submitting = false;
    }

    pub fn rollback(&mut self, snapshot: ToggleSnapshot) {
        self.count = snapshot.count;
        self.liked = snapshot.liked;
        self.submitting = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// A toggle was already in flight; nothing was sent.
    Skipped,
    Liked { count: u64 },
    Unliked { count: u64 },
}

/// Optimistic like button state for one mounted article view.
pub struct LikeStateController {
    path: Mutex<String>,
    service: Arc<LikeService>,
    liked_paths: LikedPaths,
    state: watch::Sender<ClientLikeState>,
    generation: AtomicU64,
    /// Bumped whenever a toggle starts.
    toggles: AtomicU64,
    alive: AtomicBool,
}

/// Rolls a toggle back unless it was settled, so `submitting` is cleared even
/// when the toggle future is dropped mid-flight.
struct PendingToggle<'a> {
    controller: &'a LikeStateController,
    path: String,
    snapshot: ToggleSnapshot,
    generation: u64,
    settled: bool,
}

impl PendingToggle<'_> {
    fn commit(mut self, count: u64) {
        self.settled = true;
        self.controller
            .apply(self.generation, |state| state.commit(count));
    }

    fn fail(mut self) {
        self.settled = true;
        self.restore();
    }

    fn restore(&self) {
        let snapshot = self.snapshot;
        self.controller.liked_paths.set(&self.path, snapshot.liked);
        self.controller
            .apply(self.generation, |state| state.rollback(snapshot));
    }
}

impl Drop for PendingToggle<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(path = %self.path, "toggle abandoned, rolling back");
            self.restore();
        }
    }
}

impl LikeStateController {
    pub fn new(
        path: impl Into<String>,
        service: Arc<LikeService>,
        liked_paths: LikedPaths,
    ) -> Self {
        let (state, _) = watch::channel(ClientLikeState::default());
        Self {
            path: Mutex::new(path.into()),
            service,
            liked_paths,
            state,
            generation: AtomicU64::new(0),
            toggles: AtomicU64::new(0),
            alive: AtomicBool::new(true),
        }
    }

    pub fn path(&self) -> String {
        self.path
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> ClientLikeState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientLikeState> {
        self.state.subscribe()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.alive.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Updates the published state unless the view moved on since
    /// `generation` was taken.
    fn apply(&self, generation: u64, update: impl FnOnce(&mut ClientLikeState)) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.state.send_modify(update);
        true
    }

    pub async fn toggle(&self) -> Result<ToggleOutcome, LikeError> {
        if self.state.borrow().submitting {
            debug!("toggle ignored while submitting");
            return Ok(ToggleOutcome::Skipped);
        }
        if !self.service.session().is_logged_in() {
            return Err(LikeError::LoginRequired);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let mut snapshot = None;
        self.state.send_if_modified(|state| {
            snapshot = state.begin_toggle();
            snapshot.is_some()
        });
        let Some(snapshot) = snapshot else {
            return Ok(ToggleOutcome::Skipped);
        };
        self.toggles.fetch_add(1, Ordering::SeqCst);

        let path = self.path();
        let liked = !snapshot.liked;
        self.liked_paths.set(&path, liked);
        let pending = PendingToggle {
            controller: self,
            path: path.clone(),
            snapshot,
            generation,
            settled: false,
        };

        let result = if liked {
            self.service.like_article(&path).await
        } else {
            self.service.unlike_article(&path).await
        };
        match result.and_then(|count| count.ok_or(LikeError::NoData)) {
            Ok(count) => {
                pending.commit(count);
                info!(path = %path, liked, count, "like toggled");
                Ok(if liked {
                    ToggleOutcome::Liked { count }
                } else {
                    ToggleOutcome::Unliked { count }
                })
            }
            Err(e) => {
                pending.fail();
                warn!(path = %path, error = %e, "toggle failed, state restored");
                Err(e)
            }
        }
    }

    /// Loads server truth for the current path. Results arriving after
    /// `set_path` or `unmount` are dropped, as are reads that a toggle
    /// started since hydration began has already superseded.
    pub async fn hydrate(&self) {
        let generation = self.generation.load(Ordering::SeqCst);
        let epoch = self.toggles.load(Ordering::SeqCst);
        let path = self.path();

        let hint = self.liked_paths.has_liked(&path);
        self.apply(generation, |state| {
            if !state.submitting {
                state.liked = hint;
            }
        });

        if let Some(user_id) = self.service.session().user_id() {
            let liked = self.service.check_user_liked(&path, &user_id).await;
            if !self.is_current(generation) {
                debug!(path = %path, "discarding stale membership");
                return;
            }
            if self.toggled_since(epoch) || self.state.borrow().submitting {
                debug!(path = %path, "membership superseded by a toggle");
            } else {
                self.liked_paths.set(&path, liked);
                self.apply(generation, |state| state.liked = liked);
            }
        }

        let count = self.service.get_article_stats(&path, true).await;
        if !self.is_current(generation) {
            debug!(path = %path, "discarding stale count");
            return;
        }
        let superseded = self.toggled_since(epoch);
        self.apply(generation, |state| {
            if let Some(count) = count.filter(|_| !superseded && !state.submitting) {
                state.count = count;
            }
            state.loading = false;
        });
    }

    fn toggled_since(&self, epoch: u64) -> bool {
        self.toggles.load(Ordering::SeqCst) != epoch
    }

    /// Switches to another article and hydrates it.
    pub async fn set_path(&self, path: impl Into<String>) {
        {
            let mut current = self.path.lock().unwrap_or_else(PoisonError::into_inner);
            *current = path.into();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ClientLikeState::default());
        self.hydrate().await;
    }

    pub fn unmount(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}
