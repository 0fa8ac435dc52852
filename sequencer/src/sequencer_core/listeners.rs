// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::{Arc, Mutex};

use chain_core::Block;
use tokio::runtime::Handle;
use tracing::warn;

pub type BlockListener = Arc<dyn Fn(Block) + Send + Sync + 'static>;

/// Handlers called with every block the worker commits.
///
/// Each call runs on its own blocking task so a slow handler never holds up
/// the worker. Delivery order across blocks is therefore not guaranteed.
pub(super) struct Listeners {
    handlers: Mutex<Vec<BlockListener>>,
    runtime: Option<Handle>,
}

impl Listeners {
    pub(super) fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            runtime: Handle::try_current().ok(),
        }
    }

    pub(super) fn register(&self, handler: BlockListener) {
        self.handlers
            .lock()
            .expect("block listeners mutex poisoned")
            .push(handler);
    }

    pub(super) fn notify(&self, block: &Block) {
        let handlers = self
            .handlers
            .lock()
            .expect("block listeners mutex poisoned")
            .clone();
        for handler in handlers {
            let block = block.clone();
            match &self.runtime {
                Some(runtime) => {
                    runtime.spawn_blocking(move || handler(block));
                }
                None => {
                    let spawned = std::thread::Builder::new()
                        .name("block-listener".to_string())
                        .spawn(move || handler(block));
                    if let Err(err) = spawned {
                        warn!(error = %err, "cannot spawn block listener thread");
                    }
                }
            }
        }
    }
}
