//! Per-request session state: the view, the abortion token, counters and
//! identifiers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::Notify;

use crate::chain::Chain;
use crate::error::Fault;
use crate::view::View;

/// The per-request record binding the view, the abortion token and the
/// dispatcher chain.
#[derive(Debug)]
pub struct Session {
    id: String,
    view: View,
    abortion: Abortion,
    chain: Chain,
}

impl Session {
    pub(crate) fn new(id: String, view: View) -> Self {
        Session {
            id,
            view,
            abortion: Abortion::new(),
            chain: Chain::new(),
        }
    }

    /// The request identifier this session serves.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn abortion(&self) -> &Abortion {
        &self.abortion
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }
}

/// A single-shot cancellation token with an optional fault as reason.
///
/// Any party may fire it: the downstream closing, the upstream aborting,
/// or a dispatcher calling [`Abortion::abort`]. Firing is idempotent and
/// the first reason wins. Firing never forcibly stops a running
/// dispatcher; the chain checks the token between steps and the
/// completion handler routes a fired session onto the abortion path.
#[derive(Clone, Debug, Default)]
pub struct Abortion {
    inner: Arc<AbortionInner>,
}

#[derive(Debug, Default)]
struct AbortionInner {
    fired: AtomicBool,
    reason: Mutex<Option<Fault>>,
    notify: Notify,
}

impl Abortion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. The first call wins; later reasons are discarded.
    pub fn abort(&self, reason: Option<Fault>) {
        {
            let mut slot = self.inner.reason.lock().expect("abortion reason poisoned");
            if self.inner.fired.swap(true, Ordering::SeqCst) {
                return;
            }
            *slot = reason;
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// The reason the token fired with, if any.
    pub fn reason(&self) -> Option<Fault> {
        self.inner
            .reason
            .lock()
            .expect("abortion reason poisoned")
            .clone()
    }

    /// Resolves once the token has fired.
    pub async fn fired(&self) {
        let notified = self.inner.notify.notified();
        if self.is_fired() {
            return;
        }
        notified.await;
    }
}

/// Monotonic dispatch counters, updated atomically from every connection.
///
/// Once the server is drained,
/// `dispatched == completed + abortions + rejections`.
#[derive(Debug, Default)]
pub struct Stats {
    dispatched: AtomicU64,
    completed: AtomicU64,
    abortions: AtomicU64,
    rejections: AtomicU64,
}

impl Stats {
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn abortions(&self) -> u64 {
        self.abortions.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abortion(&self) {
        self.abortions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }
}

/// A connection identifier: `<base36 millis>.<4-char base36 random>`,
/// uppercased.
pub(crate) fn connection_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let salt = rand::thread_rng().gen_range(0..36u32.pow(4));
    format!("{}.{}", base36(millis), pad4(&base36(salt as u128))).to_uppercase()
}

/// A request identifier: `<connection id>.<4-char base36 index>`.
pub(crate) fn request_id(connection: &str, index: u64) -> String {
    format!("{connection}.{}", pad4(&base36(index as u128)).to_uppercase())
}

fn base36(mut n: u128) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn pad4(digits: &str) -> String {
    format!("{digits:0>4}")
}
