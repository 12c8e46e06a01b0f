use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Authorization state of a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Granted,
    Denied,
    /// The user has not been asked yet.
    Undetermined,
}

/// Invoked once with the user's answer. May run on any thread, and may run
/// before `request_microphone` returns.
pub type PermissionCallback = Box<dyn FnOnce(bool) + Send>;

/// Platform authorization surface for the microphone.
pub trait PermissionProvider: Send + Sync {
    fn microphone_status(&self) -> PermissionStatus;
    fn request_microphone(&self, on_resolved: PermissionCallback);
}

/// Provider that answers requests immediately with a preset decision.
#[derive(Debug)]
pub struct FixedPermission {
    status: Mutex<PermissionStatus>,
    answer: bool,
}

impl FixedPermission {
    /// Reports `status` and answers any prompt with `answer`.
    pub fn new(status: PermissionStatus, answer: bool) -> Self {
        Self {
            status: Mutex::new(status),
            answer,
        }
    }

    pub fn granted() -> Self {
        Self::new(PermissionStatus::Granted, true)
    }

    pub fn denied() -> Self {
        Self::new(PermissionStatus::Denied, false)
    }
}

impl PermissionProvider for FixedPermission {
    fn microphone_status(&self) -> PermissionStatus {
        *self.status.lock()
    }

    fn request_microphone(&self, on_resolved: PermissionCallback) {
        let status = if self.answer {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        };
        *self.status.lock() = status;
        tracing::debug!(?status, "microphone permission resolved");
        on_resolved(self.answer);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn undetermined_request_records_answer() {
        let provider = FixedPermission::new(PermissionStatus::Undetermined, false);
        let answered = Arc::new(AtomicBool::new(true));
        let slot = answered.clone();

        provider.request_microphone(Box::new(move |granted| {
            slot.store(granted, Ordering::SeqCst);
        }));

        assert!(!answered.load(Ordering::SeqCst));
        assert_eq!(provider.microphone_status(), PermissionStatus::Denied);
    }
}
