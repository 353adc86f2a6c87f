use pkgmgr_core::UserId;
use pkgmgr_registry::AppId;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    PackageAdded {
        name: String,
        user: UserId,
        app_id: AppId,
        replacing: bool,
    },
    PackageReplaced {
        name: String,
        user: UserId,
        app_id: AppId,
    },
    /// Sent to the installer the first time a package lands for a user.
    FirstLaunch {
        name: String,
        user: UserId,
        installer: Option<String>,
    },
    PackageRemoved {
        name: String,
        user: UserId,
        app_id: AppId,
        data_removed: bool,
        replacing: bool,
    },
    PackageFullyRemoved {
        name: String,
        app_id: AppId,
    },
    PackageDataCleared {
        name: String,
        user: UserId,
    },
    PackageMoved {
        name: String,
        volume_uuid: Option<String>,
    },
    PermissionsChanged {
        name: String,
        app_id: AppId,
    },
}

impl LifecycleEvent {
    pub fn package(&self) -> &str {
        match self {
            Self::PackageAdded { name, .. }
            | Self::PackageReplaced { name, .. }
            | Self::FirstLaunch { name, .. }
            | Self::PackageRemoved { name, .. }
            | Self::PackageFullyRemoved { name, .. }
            | Self::PackageDataCleared { name, .. }
            | Self::PackageMoved { name, .. }
            | Self::PermissionsChanged { name, .. } => name,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Fan-out of lifecycle events to any number of subscribers. Slow
/// subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: LifecycleEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            debug!(package = event.package(), "no subscriber for lifecycle event");
        }
    }
}
