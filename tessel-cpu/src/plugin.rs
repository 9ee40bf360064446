use crate::{Exception, SyncType};

/// The version string offered to plugins during registration.
pub const PLUGIN_API_VERSION: &str = "1.0";

/// Passed to a plugin each time one of its synchronization phases is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseEvent {
    pub core_id: u32,
    pub cluster_id: u32,
    pub phase: SyncType,
    /// Ordinal of the instruction inside its translation unit.
    pub inst_id: u32,
}

pub trait VmPlugin {
    /// Registration handshake. Returns the phases the plugin wants to observe, or `None` to
    /// decline (e.g. if `version` is not supported).
    fn registration(&mut self, version: &str) -> Option<SyncType>;

    /// Called from generated code. Must not register or unregister plugins.
    fn callback(&mut self, event: &PhaseEvent);
}

/// Handle for a registered plugin, stable for the lifetime of the owning [PluginTable].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PluginId(pub u32);

struct PluginEntry {
    sync: SyncType,
    plugin: Box<dyn VmPlugin>,
}

/// Plugins that accepted registration, indexed by [PluginId].
#[derive(Default)]
pub struct PluginTable {
    entries: Vec<PluginEntry>,
}

impl PluginTable {
    /// Runs the registration handshake of `plugin`, keeping it only if it accepts.
    pub fn register(&mut self, mut plugin: Box<dyn VmPlugin>) -> Option<PluginId> {
        let sync = match plugin.registration(PLUGIN_API_VERSION) {
            Some(sync) => sync,
            None => {
                tracing::warn!("plugin rejected registration (version {PLUGIN_API_VERSION})");
                return None;
            }
        };
        let id = PluginId(self.entries.len().try_into().ok()?);
        tracing::debug!("registered plugin {} (sync={sync:?})", id.0);
        self.entries.push(PluginEntry { sync, plugin });
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns every registered plugin along with the phases it observes.
    pub fn iter(&self) -> impl Iterator<Item = (PluginId, SyncType)> + '_ {
        self.entries.iter().enumerate().map(|(i, entry)| (PluginId(i as u32), entry.sync))
    }

    /// Returns the plugins that observe any of the phases in `phase`.
    pub fn observers(&self, phase: SyncType) -> impl Iterator<Item = PluginId> + '_ {
        self.iter().filter(move |(_, sync)| sync.intersects(phase)).map(|(id, _)| id)
    }

    /// Invokes the callback of plugin `id`. Returns false if there is no such plugin.
    pub fn call(&mut self, id: PluginId, event: &PhaseEvent) -> bool {
        match self.entries.get_mut(id.0 as usize) {
            Some(entry) => {
                entry.plugin.callback(event);
                true
            }
            None => false,
        }
    }
}

/// The hook an interactive debugger provides. Only invoked while debugging is enabled.
pub trait Debugger {
    /// Called before the instruction at `pc` executes. Returning an error ends the current unit
    /// and delivers the exception to the driver.
    fn check_continue(&mut self, pc: u64) -> Result<(), Exception>;
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    struct Recorder {
        sync: Option<SyncType>,
        events: Rc<RefCell<Vec<PhaseEvent>>>,
    }

    impl VmPlugin for Recorder {
        fn registration(&mut self, version: &str) -> Option<SyncType> {
            assert_eq!(version, PLUGIN_API_VERSION);
            self.sync
        }

        fn callback(&mut self, event: &PhaseEvent) {
            self.events.borrow_mut().push(*event);
        }
    }

    fn recorder(sync: Option<SyncType>) -> (Box<Recorder>, Rc<RefCell<Vec<PhaseEvent>>>) {
        let events = Rc::new(RefCell::new(vec![]));
        (Box::new(Recorder { sync, events: events.clone() }), events)
    }

    #[test]
    fn rejected_plugins_are_not_recorded() {
        let mut table = PluginTable::default();

        let (pre, _) = recorder(Some(SyncType::PRE));
        let (rejected, _) = recorder(None);
        let (post, _) = recorder(Some(SyncType::POST));

        assert_eq!(table.register(pre), Some(PluginId(0)));
        assert_eq!(table.register(rejected), None);
        assert_eq!(table.register(post), Some(PluginId(1)));

        assert_eq!(table.len(), 2);
        assert_eq!(table.observers(SyncType::PRE).collect::<Vec<_>>(), [PluginId(0)]);
        assert_eq!(table.observers(SyncType::POST).collect::<Vec<_>>(), [PluginId(1)]);
        assert_eq!(table.observers(SyncType::ALL).count(), 2);
    }

    #[test]
    fn call_dispatches_by_id() {
        let mut table = PluginTable::default();
        let (plugin, events) = recorder(Some(SyncType::ALL));
        let id = table.register(plugin).unwrap();

        let event = PhaseEvent { core_id: 1, cluster_id: 2, phase: SyncType::PRE, inst_id: 3 };
        assert!(table.call(id, &event));
        assert!(!table.call(PluginId(7), &event));
        assert_eq!(*events.borrow(), [event]);
    }
}
