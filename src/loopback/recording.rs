//! In-memory aliaser for tests.

use super::error::AliasError;
use super::{LoopbackAlias, LoopbackAliaser};
use std::fmt;
use std::sync::Mutex;

type AddObserver = Box<dyn Fn(&LoopbackAlias) + Send + Sync>;

/// A single recorded alias operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasOp {
    /// `ensure_alias` was called.
    Add(LoopbackAlias),
    /// `remove_alias` was called.
    Remove(LoopbackAlias),
}

/// Aliaser that records every call instead of touching the system.
#[derive(Default)]
pub struct RecordingAliaser {
    ops: Mutex<Vec<AliasOp>>,
    fail_add: bool,
    fail_remove: bool,
    present: bool,
    on_add: Option<AddObserver>,
}

impl fmt::Debug for RecordingAliaser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingAliaser")
            .field("ops", &self.ops())
            .field("fail_add", &self.fail_add)
            .field("fail_remove", &self.fail_remove)
            .field("present", &self.present)
            .finish()
    }
}

impl RecordingAliaser {
    /// Create a recorder whose operations always succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a recorder whose `ensure_alias` always fails.
    pub fn failing() -> Self {
        Self {
            fail_add: true,
            ..Self::default()
        }
    }

    /// Make `remove_alias` fail after recording the call.
    pub fn with_failing_remove(mut self) -> Self {
        self.fail_remove = true;
        self
    }

    /// Report every alias as already present on the interface.
    pub fn already_present(mut self) -> Self {
        self.present = true;
        self
    }

    /// Run `observer` inside every successful `ensure_alias` call.
    pub fn on_add(mut self, observer: impl Fn(&LoopbackAlias) + Send + Sync + 'static) -> Self {
        self.on_add = Some(Box::new(observer));
        self
    }

    /// Snapshot of every operation recorded so far.
    pub fn ops(&self) -> Vec<AliasOp> {
        self.ops.lock().map(|ops| ops.clone()).unwrap_or_default()
    }

    fn record(&self, op: AliasOp) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.push(op);
        }
    }
}

impl LoopbackAliaser for RecordingAliaser {
    fn ensure_alias(&self, alias: &LoopbackAlias) -> Result<bool, AliasError> {
        if self.fail_add {
            return Err(AliasError::Rejected(format!("add {}", alias)));
        }
        self.record(AliasOp::Add(*alias));
        if let Some(observer) = &self.on_add {
            observer(alias);
        }
        Ok(!self.present)
    }

    fn remove_alias(&self, alias: &LoopbackAlias) -> Result<(), AliasError> {
        self.record(AliasOp::Remove(*alias));
        if self.fail_remove {
            return Err(AliasError::Rejected(format!("remove {}", alias)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn alias() -> LoopbackAlias {
        LoopbackAlias::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)))
    }

    #[test]
    fn test_records_in_order() {
        let aliaser = RecordingAliaser::new();
        assert!(aliaser.ensure_alias(&alias()).unwrap());
        aliaser.remove_alias(&alias()).unwrap();

        assert_eq!(
            aliaser.ops(),
            vec![AliasOp::Add(alias()), AliasOp::Remove(alias())]
        );
    }

    #[test]
    fn test_failing_add_records_nothing() {
        let aliaser = RecordingAliaser::failing();
        assert!(matches!(
            aliaser.ensure_alias(&alias()),
            Err(AliasError::Rejected(_))
        ));
        assert!(aliaser.ops().is_empty());
    }

    #[test]
    fn test_already_present_reports_not_added() {
        let aliaser = RecordingAliaser::new().already_present();
        assert!(!aliaser.ensure_alias(&alias()).unwrap());
        assert_eq!(aliaser.ops(), vec![AliasOp::Add(alias())]);
    }

    #[test]
    fn test_on_add_observer_sees_alias() {
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let aliaser = RecordingAliaser::new().on_add(move |alias| {
            sink.lock().unwrap().push(*alias);
        });

        aliaser.ensure_alias(&alias()).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![alias()]);
    }

    #[test]
    fn test_failing_remove_still_records() {
        let aliaser = RecordingAliaser::new().with_failing_remove();
        assert!(aliaser.remove_alias(&alias()).is_err());
        assert_eq!(aliaser.ops(), vec![AliasOp::Remove(alias())]);
    }
}
