//! Value types and collaborator interfaces shared by the translation core and the architectures
//! plugged into it.

mod addr;
mod arch;
mod config;
mod exception;
mod exit;
mod plugin;
mod sync;
pub mod utils;

pub use crate::{
    addr::{AccessType, ClusterId, Continuation, PhysAddr, VirtAddr},
    arch::{ArchIf, RegLayout, RegSlot},
    config::{Config, ConfigError},
    exception::{Exception, STOP_CLEAN},
    exit::VmExit,
    plugin::{Debugger, PhaseEvent, PluginId, PluginTable, VmPlugin, PLUGIN_API_VERSION},
    sync::{ExecPhase, SyncType},
};
