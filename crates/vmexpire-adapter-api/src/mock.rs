//! Mock adapters for testing

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vmexpire_util::VmId;

use crate::{AdapterError, AdapterResult, Deleter, Notice, Notifier};

/// Notifier that records every notice it is asked to send
#[derive(Clone, Default)]
pub struct MockNotifier {
    sent: Arc<Mutex<Vec<Notice>>>,

    /// Configure send to fail
    pub fail_send: Arc<Mutex<bool>>,

    /// Delay before answering (simulates a slow relay)
    pub delay: Arc<Mutex<Option<Duration>>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices delivered so far
    pub fn sent(&self) -> Vec<Notice> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail_send.lock().unwrap() = fail;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, notice: &Notice) -> AdapterResult<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if *self.fail_send.lock().unwrap() {
            return Err(AdapterError::Unavailable("Mock notifier failure".into()));
        }

        self.sent.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

/// Deleter that tracks deletions and can be told to fail
#[derive(Clone, Default)]
pub struct MockDeleter {
    deleted: Arc<Mutex<Vec<VmId>>>,
    calls: Arc<Mutex<usize>>,

    /// Error returned by every call while set
    pub fail_with: Arc<Mutex<Option<AdapterError>>>,

    /// VMs the provider no longer knows about
    pub gone: Arc<Mutex<HashSet<VmId>>>,

    pub delay: Arc<Mutex<Option<Duration>>>,
}

impl MockDeleter {
    pub fn new() -> Self {
        Self::default()
    }

    /// VMs successfully deleted, in call order
    pub fn deleted(&self) -> Vec<VmId> {
        self.deleted.lock().unwrap().clone()
    }

    /// Total delete calls, failed ones included
    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    pub fn set_failure(&self, error: Option<AdapterError>) {
        *self.fail_with.lock().unwrap() = error;
    }

    pub fn mark_gone(&self, vm_id: VmId) {
        self.gone.lock().unwrap().insert(vm_id);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl Deleter for MockDeleter {
    async fn delete(&self, vm_id: &VmId) -> AdapterResult<()> {
        *self.calls.lock().unwrap() += 1;

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }

        if self.gone.lock().unwrap().contains(vm_id) {
            return Err(AdapterError::VmNotFound);
        }

        self.deleted.lock().unwrap().push(vm_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmexpire_api::NotificationKind;
    use vmexpire_util::ProjectId;

    #[tokio::test]
    async fn mock_deleter_failure_modes() {
        let deleter = MockDeleter::new();
        let vm = VmId::new("vm-1");

        deleter.set_failure(Some(AdapterError::Timeout));
        assert_eq!(deleter.delete(&vm).await, Err(AdapterError::Timeout));

        deleter.set_failure(None);
        deleter.mark_gone(VmId::new("vm-2"));
        assert_eq!(
            deleter.delete(&VmId::new("vm-2")).await,
            Err(AdapterError::VmNotFound)
        );

        deleter.delete(&vm).await.unwrap();
        assert_eq!(deleter.deleted(), vec![vm]);
        assert_eq!(deleter.call_count(), 3);
    }

    #[tokio::test]
    async fn mock_notifier_records() {
        let notifier = MockNotifier::new();
        let notice = Notice {
            project_id: ProjectId::new("proj"),
            vm_id: VmId::new("vm-1"),
            kind: NotificationKind::Deleted,
            expires_at: None,
        };

        notifier.send(&notice).await.unwrap();
        notifier.set_fail(true);
        assert!(notifier.send(&notice).await.is_err());
        assert_eq!(notifier.sent(), vec![notice]);
    }
}
