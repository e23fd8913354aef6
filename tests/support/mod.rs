//! Shared fixtures for engine integration tests.
#![allow(dead_code)] // not every test binary uses every helper

use camino::Utf8PathBuf;
use galley::{
    CacheStore, Engine, EngineConfig, Identity, PhaseCallback, RecipeKey, StaticLoader,
    format_key,
};
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// One isolated cache root plus a shared in-memory loader. Multiple
/// engines opened from the same bed share the cache, which is how the
/// cross-process behavior is exercised in-process.
pub struct TestBed {
    _td: TempDir,
    pub cache_root: Utf8PathBuf,
    pub loader: Arc<StaticLoader>,
}

impl TestBed {
    pub fn new() -> Self {
        let td = TempDir::new().unwrap();
        let cache_root = Utf8PathBuf::from_path_buf(td.path().join("cache")).unwrap();
        Self {
            _td: td,
            cache_root,
            loader: Arc::new(StaticLoader::new()),
        }
    }

    pub fn engine(&self) -> Engine {
        self.engine_with(EngineConfig::new())
    }

    pub fn engine_with(&self, config: EngineConfig) -> Engine {
        let store = CacheStore::open_at(&self.cache_root).unwrap();
        let config = if config.workers.is_none() {
            config.workers(2)
        } else {
            config
        };
        Engine::new(store, self.loader.clone(), config)
    }
}

pub fn id(s: &str) -> Identity {
    Identity::parse(s).unwrap()
}

pub fn key(s: &str) -> RecipeKey {
    format_key(&id(s), "")
}

/// Counter bumped by instrumented callbacks.
pub fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

pub fn count_of(c: &Arc<AtomicUsize>) -> usize {
    c.load(Ordering::SeqCst)
}

/// An install callback that writes `content` into `<install>/payload.txt`
/// and bumps `calls`.
pub fn install_payload(calls: &Arc<AtomicUsize>, content: &'static str) -> PhaseCallback {
    let calls = Arc::clone(calls);
    Arc::new(move |ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        fs::write(ctx.install_dir().join("payload.txt").as_std_path(), content)?;
        Ok(())
    })
}

/// A callback that only counts invocations.
pub fn counting_callback(calls: &Arc<AtomicUsize>) -> PhaseCallback {
    let calls = Arc::clone(calls);
    Arc::new(move |_ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}
