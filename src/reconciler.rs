use lazy_static::lazy_static;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::dom::{Document, MutationRecord, NodeId, ObserveOptions, Selector};
use crate::models::is_like_marker;

const HIDDEN_ATTR: &str = "data-like-hidden";
const REARRANGED_ATTR: &str = "data-rearranged";
const ENHANCED_ATTR: &str = "data-enhanced";
const TOOLTIP_ATTR: &str = "data-tooltip";
const RAW_COUNT_ATTR: &str = "data-like-raw-count";
const WRITTEN_COUNT_ATTR: &str = "data-like-written-count";
const CARET_ATTR: &str = "data-selection-start";

lazy_static! {
    static ref CARD: Selector = selector(".wl-card");
    static ref CONTENT: Selector = selector(".wl-content");
    static ref HEAD: Selector = selector(".wl-head");
    static ref NICK: Selector = selector(".wl-nick");
    static ref BADGE: Selector = selector(".wl-badge");
    static ref META: Selector = selector(".wl-meta");
    static ref META_SPAN: Selector = selector(".wl-meta > span");
    static ref TIME: Selector = selector(".wl-time");
    static ref SPACER: Selector = selector(".spacer");
    static ref ACTIONS: Selector = selector(".wl-comment-actions");
    static ref REPLY: Selector = selector(".wl-reply");
    static ref EDITOR: Selector = selector(".wl-editor");
    static ref HIDDEN: Selector = selector("[data-like-hidden]");
    static ref ENTRY: [Selector; 3] = [
        selector(".wl-card-item"),
        selector(".wl-item"),
        selector(".wl-card"),
    ];
    static ref COUNTERS: [Selector; 3] = [
        selector(".wl-count"),
        selector(".wl-meta-head .wl-num"),
        selector("[data-comment-count]"),
    ];
    static ref NUMERAL: Regex = Regex::new(r"\d+").expect("valid numeral regex");
    static ref COUNT_PHRASE: Regex =
        Regex::new(r"(?i)^\s*\d+\s*(?:条\s*)?(?:评论|comments?|replies)\s*$")
            .expect("valid count phrase regex");
}

fn selector(source: &str) -> Selector {
    Selector::parse(source).expect("built-in selector")
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Quiet period after the last observed mutation before a pass runs.
    pub debounce: Duration,
    /// Delay before the first pass, letting the widget finish rendering.
    pub startup_delay: Duration,
    /// How long the observer stays disconnected after a counter rewrite.
    pub reconnect_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            startup_delay: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub passes: u64,
    pub hidden_total: usize,
    pub counter_rewrites: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was already running.
    Busy,
    /// Nothing changed since the previous pass.
    Unchanged,
    Completed {
        newly_hidden: usize,
        counters_rewritten: bool,
    },
}

#[derive(Default)]
struct PassState {
    stats: ReconcilerStats,
    last_fingerprint: Option<String>,
}

/// Keeps an externally rendered comment widget consistent with likes stored
/// as comments: hides like entries, corrects visible comment counts and
/// tidies each entry's layout.
pub struct CommentFeedReconciler {
    document: Arc<Mutex<Document>>,
    container: NodeId,
    config: ReconcilerConfig,
    in_pass: AtomicBool,
    state: Mutex<PassState>,
}

struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CommentFeedReconciler {
    pub fn new(
        document: Arc<Mutex<Document>>,
        container: NodeId,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            document,
            container,
            config,
            in_pass: AtomicBool::new(false),
            state: Mutex::new(PassState::default()),
        }
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.lock_state().stats
    }

    fn lock_document(&self) -> MutexGuard<'_, Document> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, PassState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One full reconciliation sweep over the container.
    pub fn run_pass(&self) -> PassOutcome {
        if self.in_pass.swap(true, Ordering::SeqCst) {
            return PassOutcome::Busy;
        }
        let _guard = PassGuard(&self.in_pass);

        let mut doc = self.lock_document();
        let mut state = self.lock_state();
        if state.last_fingerprint.as_deref() == Some(doc.fingerprint().as_str()) {
            return PassOutcome::Unchanged;
        }

        let container = self.container;
        let newly_hidden = hide_like_entries(&mut doc, container);
        let hidden_total = doc.select(container, &HIDDEN).len();

        let mut counters_rewritten = false;
        if hidden_total != state.stats.hidden_total {
            // The counter rewrite lands inside the observed subtree; stay
            // disconnected until the caller reconnects.
            doc.disconnect();
            counters_rewritten = correct_counters(&mut doc, container, hidden_total);
            state.stats.hidden_total = hidden_total;
            if counters_rewritten {
                state.stats.counter_rewrites += 1;
            }
        }

        rearrange_headers(&mut doc, container);
        reorganize_action_buttons(&mut doc, container);
        enhance_reply_buttons(&mut doc, container);
        add_tooltips(&mut doc, container);

        state.stats.passes += 1;
        state.last_fingerprint = Some(doc.fingerprint());
        debug!(
            newly_hidden,
            hidden_total, counters_rewritten, "reconciliation pass finished"
        );
        PassOutcome::Completed {
            newly_hidden,
            counters_rewritten,
        }
    }

    fn connect(&self, sink: &UnboundedSender<MutationRecord>) {
        self.lock_document()
            .observe(self.container, ObserveOptions::CONTENT, sink.clone());
    }

    pub fn disconnect(&self) {
        self.lock_document().disconnect();
    }

    fn changed_since_last_pass(&self) -> bool {
        let fingerprint = self.lock_document().fingerprint();
        self.lock_state().last_fingerprint.as_deref() != Some(fingerprint.as_str())
    }

    /// Runs passes until the observer is attached again and nothing slipped
    /// through while it was detached.
    async fn settle(&self, sink: &UnboundedSender<MutationRecord>) {
        loop {
            let outcome = self.run_pass();
            debug!(?outcome, "reconciliation pass");
            let observed = self.lock_document().is_observed();
            if observed {
                return;
            }
            tokio::time::sleep(self.config.reconnect_delay).await;
            self.connect(sink);
            if !self.changed_since_last_pass() {
                return;
            }
        }
    }

    /// Watches the container until the task is dropped or aborted.
    pub async fn run(self: Arc<Self>) {
        let (sink, mut records) = mpsc::unbounded_channel();
        self.connect(&sink);

        tokio::time::sleep(self.config.startup_delay).await;
        // The first pass covers everything rendered so far.
        while records.try_recv().is_ok() {}
        self.settle(&sink).await;

        while records.recv().await.is_some() {
            loop {
                match tokio::time::timeout(self.config.debounce, records.recv()).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
            self.settle(&sink).await;
        }
    }

    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        info!("comment feed reconciler started");
        let task = tokio::spawn(self.clone().run());
        ReconcilerHandle {
            task,
            reconciler: self,
        }
    }

    /// Pre-fills the editor with an `@author ` mention for a wired reply
    /// button. Returns false when the button, author or editor is missing.
    pub fn handle_reply_click(&self, button: NodeId) -> bool {
        let mut doc = self.lock_document();
        if !doc.has_attr(button, ENHANCED_ATTR) {
            return false;
        }
        let username = doc
            .closest(button, &CARD)
            .and_then(|card| doc.select_first(card, &NICK))
            .map(|nick| doc.text_content(nick).trim().to_string())
            .filter(|name| !name.is_empty());
        let editor = doc.select_first(self.container, &EDITOR);
        let (Some(username), Some(editor)) = (username, editor) else {
            return false;
        };

        let mention = format!("@{username} ");
        let value = doc.attr(editor, "value").unwrap_or_default().to_string();
        if !value.contains(&mention) {
            doc.set_attr(editor, "value", &format!("{mention}{value}"));
            doc.set_attr(editor, CARET_ATTR, &mention.chars().count().to_string());
        }
        true
    }
}

/// Stops the watcher and detaches the observer when dropped.
pub struct ReconcilerHandle {
    task: JoinHandle<()>,
    reconciler: Arc<CommentFeedReconciler>,
}

impl ReconcilerHandle {
    pub fn reconciler(&self) -> &Arc<CommentFeedReconciler> {
        &self.reconciler
    }

    /// Same as dropping the handle.
    pub fn stop(self) {}
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.task.abort();
        self.reconciler.disconnect();
    }
}

fn entry_of(doc: &Document, content: NodeId) -> NodeId {
    ENTRY
        .iter()
        .find_map(|sel| doc.closest(content, sel))
        .unwrap_or(content)
}

/// Hides every entry whose body is the like marker. Returns how many were
/// newly hidden.
fn hide_like_entries(doc: &mut Document, container: NodeId) -> usize {
    let mut newly_hidden = 0;
    for content in doc.select(container, &CONTENT) {
        if !is_like_marker(&doc.text_content(content)) {
            continue;
        }
        let entry = entry_of(doc, content);
        if doc.has_attr(entry, HIDDEN_ATTR) {
            continue;
        }
        doc.set_attr(entry, "style", "display: none");
        doc.set_attr(entry, HIDDEN_ATTR, "true");
        newly_hidden += 1;
    }
    newly_hidden
}

fn correct_counters(doc: &mut Document, container: NodeId, hidden_total: usize) -> bool {
    for sel in COUNTERS.iter() {
        let mut matched = false;
        for counter in doc.select(container, sel) {
            if doc.closest(counter, &HIDDEN).is_some() {
                continue;
            }
            let text_node = doc
                .descendants(counter)
                .into_iter()
                .find(|&id| doc.text(id).is_some_and(|t| NUMERAL.is_match(t)));
            if let Some(text_node) = text_node {
                rewrite_count(doc, counter, text_node, hidden_total);
                matched = true;
            }
        }
        if matched {
            return true;
        }
    }

    // No known counter; look for text that reads like one.
    let candidate = doc.descendants(container).into_iter().find(|&id| {
        doc.text(id).is_some_and(|t| COUNT_PHRASE.is_match(t))
            && doc.closest(id, &HIDDEN).is_none()
            && doc.closest(id, &CONTENT).is_none()
    });
    match candidate.and_then(|text| doc.parent(text).map(|owner| (owner, text))) {
        Some((owner, text)) => {
            rewrite_count(doc, owner, text, hidden_total);
            true
        }
        None => false,
    }
}

/// Rewrites the first numeral in `text_node` to the raw count minus
/// `hidden_total`. The raw count and the written value are kept on `owner` so
/// a number this reconciler wrote is never reduced twice.
fn rewrite_count(doc: &mut Document, owner: NodeId, text_node: NodeId, hidden_total: usize) {
    let Some(text) = doc.text(text_node).map(str::to_string) else {
        return;
    };
    let Some(found) = NUMERAL.find(&text) else {
        return;
    };
    let Ok(shown) = found.as_str().parse::<u64>() else {
        return;
    };
    let stored = |name: &str| doc.attr(owner, name).and_then(|v| v.parse::<u64>().ok());
    let raw = match (stored(WRITTEN_COUNT_ATTR), stored(RAW_COUNT_ATTR)) {
        (Some(written), Some(raw)) if written == shown => raw,
        _ => shown,
    };
    let corrected = raw.saturating_sub(hidden_total as u64);

    doc.set_attr(owner, RAW_COUNT_ATTR, &raw.to_string());
    doc.set_attr(owner, WRITTEN_COUNT_ATTR, &corrected.to_string());
    if corrected != shown {
        let mut updated = text.clone();
        updated.replace_range(found.range(), &corrected.to_string());
        doc.set_text(text_node, &updated);
    }
}

fn rearrange_headers(doc: &mut Document, container: NodeId) {
    for card in doc.select(container, &CARD) {
        let Some(head) = doc.select_first(card, &HEAD) else {
            continue;
        };
        if doc.has_attr(head, REARRANGED_ATTR) {
            continue;
        }
        doc.set_attr(head, REARRANGED_ATTR, "true");

        let nick = doc.select_first(head, &NICK);
        let badge = doc.select_first(head, &BADGE);
        let meta = doc.select_first(head, &META);
        let time = doc.select_first(head, &TIME);

        if let (Some(nick), Some(time)) = (nick, time) {
            doc.insert_after(badge.unwrap_or(nick), time);
        }
        if let Some(meta) = meta {
            match (badge, nick, time) {
                (Some(badge), Some(_), None) => doc.insert_after(badge, meta),
                (_, _, Some(time)) => doc.insert_after(time, meta),
                (_, Some(nick), None) => doc.insert_after(nick, meta),
                _ => {}
            }
        }
        if doc.select_first(head, &SPACER).is_none() {
            if let Some(reference) = meta.or(time) {
                let spacer = doc.create_element("div");
                doc.set_attr(spacer, "class", "spacer");
                doc.insert_after(reference, spacer);
            }
        }
    }
}

/// Puts each entry's action bar directly after its body.
fn reorganize_action_buttons(doc: &mut Document, container: NodeId) {
    for card in doc.select(container, &CARD) {
        let content = doc.select_first(card, &CONTENT);
        let actions = doc.select_first(card, &ACTIONS);
        if let (Some(content), Some(actions)) = (content, actions) {
            if doc.next_sibling(content) != Some(actions) {
                doc.insert_after(content, actions);
                doc.add_class(actions, "reorganized");
            }
        }
    }
}

fn enhance_reply_buttons(doc: &mut Document, container: NodeId) {
    for button in doc.select(container, &REPLY) {
        if !doc.has_attr(button, ENHANCED_ATTR) {
            doc.set_attr(button, ENHANCED_ATTR, "true");
        }
    }
}

/// Sets `title` on each body to "time | meta" taken from its own entry.
fn add_tooltips(doc: &mut Document, container: NodeId) {
    for content in doc.select(container, &CONTENT) {
        if doc.has_attr(content, TOOLTIP_ATTR) {
            continue;
        }
        let Some(title) = doc
            .closest(content, &CARD)
            .and_then(|card| tooltip_for(doc, card))
        else {
            continue;
        };
        doc.set_attr(content, "title", &title);
        doc.set_attr(content, TOOLTIP_ATTR, "true");
    }
}

fn tooltip_for(doc: &Document, card: NodeId) -> Option<String> {
    // Nested replies are cards too; only this card's own fields count.
    let own = |node: &NodeId| doc.closest(*node, &CARD) == Some(card);
    let time = doc
        .select(card, &TIME)
        .into_iter()
        .find(own)
        .map(|t| doc.text_content(t).trim().to_string())
        .unwrap_or_default();
    let meta = doc
        .select(card, &META_SPAN)
        .into_iter()
        .filter(own)
        .map(|s| doc.text_content(s).trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let parts: Vec<String> = [time, meta].into_iter().filter(|s| !s.is_empty()).collect();
    (!parts.is_empty()).then(|| parts.join(" | "))
}
