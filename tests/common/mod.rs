//! Helpers shared by the integration tests

#![allow(dead_code)]

use gnfs::{Driver, Fs, FsConfig, MemoryService, ProgressEvent, PublishStatus, Uri};
use std::path::Path;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

pub type Events = mpsc::UnboundedReceiver<ProgressEvent>;

pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub fn config(dir: &Path, persistence: bool) -> FsConfig {
    FsConfig {
        state_dir: dir.join("state"),
        persistence,
        do_probes: false,
        ..Default::default()
    }
}

/// Client context on `service`, resuming whatever `config` has persisted
pub fn start(config: &FsConfig, service: &MemoryService) -> (Driver<MemoryService>, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    let fs = Fs::new(config.clone(), tx).expect("client context");
    (Driver::new(fs, service.clone()), rx)
}

pub fn drain(rx: &mut Events) -> Vec<ProgressEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// URI reported when the root of a publish completed
pub fn root_uri(events: &[ProgressEvent]) -> Option<Uri> {
    events.iter().find_map(|ev| match ev {
        ProgressEvent::Publish(e) if e.is_root() => match &e.status {
            PublishStatus::Completed { chk_uri, .. } => Some(chk_uri.clone()),
            _ => None,
        },
        _ => None,
    })
}

pub fn errors(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|ev| ev.error().map(str::to_owned))
        .collect()
}
