//! Scripting collaborator surface
//!
//! Scripts read entity values through a [`WorldView`] and issue commands
//! into the tick loop's script queue. They never touch the store directly:
//! the tick loop applies their commands with the same rules as network
//! commands, so a script cannot do anything a client could not.

use std::sync::Arc;

use tracing::debug;

use crate::error::SyncError;
use crate::game::command::CommandKind;
use crate::game::entity::{EntityId, EntityState};
use crate::game::view::{WorldFrame, WorldView};
use crate::net::queue::QueueSender;

/// Command issued by a script on behalf of an entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptCommand {
    pub actor: EntityId,
    pub kind: CommandKind,
}

/// Handle given to the scripting host
pub struct ScriptBridge {
    view: WorldView,
    commands: QueueSender<ScriptCommand>,
}

impl ScriptBridge {
    pub fn new(view: WorldView, commands: QueueSender<ScriptCommand>) -> Self {
        Self { view, commands }
    }

    /// Consistent frame to read from
    pub fn frame(&self) -> Arc<WorldFrame> {
        self.view.latest()
    }

    pub fn entity(&self, id: EntityId) -> Option<EntityState> {
        self.view.latest().get(id).copied()
    }

    /// Queue a command for the next tick
    ///
    /// The script queue drops its oldest command when full. `Ok(true)` means
    /// an earlier command was evicted and will never be applied.
    ///
    /// Rejections (unknown entity, invalid values) happen in the tick loop
    /// and are reported as server events.
    pub fn issue(&self, actor: EntityId, kind: CommandKind) -> Result<bool, SyncError> {
        let evicted = self.commands.push(ScriptCommand { actor, kind })?;
        if evicted {
            debug!("Script queue full, dropped the oldest command");
        }
        Ok(evicted)
    }
}
