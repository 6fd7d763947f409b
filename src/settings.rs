//! A generic hot-reloadable settings handle.
//!
//! Backed by `tokio::sync::watch`: a `SettingsUpdater` pushes new values, a
//! `SettingsNotifier` exposes the current value and a way to wait for
//! changes, and `SettingsHandle` bundles both for the common case of a
//! component that owns its settings and hands out read access.
//!
//! Used by the proxy controller for its allowlists (`§4.G`) and by the
//! store manager for per-store construction parameters.

use tokio::sync::watch;

/// Write side of a settings channel.
#[derive(Debug)]
pub struct SettingsUpdater<S> {
    sender: watch::Sender<S>,
}

impl<S: Clone> SettingsUpdater<S> {
    /// Push a new settings value, waking every waiting notifier.
    pub fn update(&self, settings: S) {
        // A closed receiver side just means nobody's listening right now;
        // that's not an error for the updater.
        let _ = self.sender.send(settings);
    }

    #[must_use]
    pub fn current(&self) -> S {
        self.sender.borrow().clone()
    }
}

/// Read side of a settings channel.
#[derive(Debug, Clone)]
pub struct SettingsNotifier<S> {
    receiver: watch::Receiver<S>,
}

impl<S: Clone> SettingsNotifier<S> {
    #[must_use]
    pub fn current(&self) -> S {
        self.receiver.borrow().clone()
    }

    /// Resolve the next time the settings value changes.
    ///
    /// # Errors
    ///
    /// Returns an error if every corresponding [`SettingsUpdater`] has been
    /// dropped.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.receiver.changed().await
    }
}

/// Bundles an updater and a notifier constructed from the same initial
/// value.
pub struct SettingsHandle<S> {
    updater: SettingsUpdater<S>,
    notifier: SettingsNotifier<S>,
}

impl<S: Clone> SettingsHandle<S> {
    #[must_use]
    pub fn new(initial: S) -> Self {
        let (sender, receiver) = watch::channel(initial);
        Self {
            updater: SettingsUpdater { sender },
            notifier: SettingsNotifier { receiver },
        }
    }

    #[must_use]
    pub fn updater(&self) -> &SettingsUpdater<S> {
        &self.updater
    }

    #[must_use]
    pub fn notifier(&self) -> SettingsNotifier<S> {
        self.notifier.clone()
    }

    #[must_use]
    pub fn current(&self) -> S {
        self.updater.current()
    }
}
