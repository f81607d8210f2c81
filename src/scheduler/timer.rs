use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Armed {
    generation: u64,
    handle: JoinHandle<()>,
}

/// The one deferred callback a session may have pending.
///
/// Arming replaces (and aborts) whatever was armed before. A fire that still
/// slips through after replacement carries its old generation and is ignored
/// by the receiver.
#[derive(Default)]
pub struct PhaseTimer {
    armed: Option<Armed>,
}

impl PhaseTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` on `tx` at `at`, replacing any pending callback.
    pub fn arm<T>(&mut self, generation: u64, at: Instant, tx: mpsc::Sender<T>, message: T)
    where
        T: Send + 'static,
    {
        self.cancel();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            let _ = tx.send(message).await;
        });
        self.armed = Some(Armed { generation, handle });
    }

    pub fn cancel(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.handle.abort();
        }
    }

    /// Generation of the pending callback, if one is armed.
    pub fn armed_generation(&self) -> Option<u64> {
        self.armed.as_ref().map(|a| a.generation)
    }

    /// Forget the pending callback once its fire for `generation` has arrived.
    pub fn fired(&mut self, generation: u64) {
        if self.armed_generation() == Some(generation) {
            self.armed = None;
        }
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
