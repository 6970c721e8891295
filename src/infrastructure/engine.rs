//! Engine handle provider

use crate::config::ChatConfig;
use crate::core::traits::InferenceEngine;
use crate::infrastructure::http_engine::HttpEngine;
use crate::infrastructure::worker::WorkerEngine;
use di::{Ref, inject, injectable};
use log::info;
use std::ops::Deref;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Inference runs on a dedicated background context reached by message passing.
    Worker,
    /// Inference runs on the caller's runtime.
    Direct,
}

/// The single engine handle of a session.
pub struct EngineHandle {
    mode: EngineMode,
    engine: Arc<dyn InferenceEngine>,
}

impl EngineHandle {
    /// Wraps `backend` according to the configured execution mode.
    ///
    /// Never fails: if the worker cannot start, requests fail later when they are made.
    pub fn create_with_backend(
        config: &ChatConfig,
        backend: Arc<dyn InferenceEngine>,
    ) -> EngineHandle {
        if config.use_worker {
            info!("Creating engine handle in worker mode");
            EngineHandle {
                mode: EngineMode::Worker,
                engine: Arc::new(WorkerEngine::spawn(backend)),
            }
        } else {
            info!("Creating engine handle in direct mode");
            EngineHandle {
                mode: EngineMode::Direct,
                engine: backend,
            }
        }
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn engine(&self) -> Arc<dyn InferenceEngine> {
        Arc::clone(&self.engine)
    }
}

#[injectable]
impl EngineHandle {
    #[inject]
    pub fn create(config: Ref<ChatConfig>) -> EngineHandle {
        let backend = Arc::new(HttpEngine::new(&config));
        EngineHandle::create_with_backend(&config, backend)
    }
}

impl Deref for EngineHandle {
    type Target = dyn InferenceEngine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref()
    }
}
