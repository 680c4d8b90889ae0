use tokio::sync::oneshot;

/// Messages accepted by a job controller.
#[derive(Debug)]
pub enum JobCommand {
    /// Request cooperative cancellation. Replies `true` if the job moved to
    /// `failed`, `false` if it was already terminal.
    Cancel(oneshot::Sender<bool>),
}
