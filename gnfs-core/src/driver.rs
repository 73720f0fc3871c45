//! Event loop connecting an [`Fs`] to a [`Service`]
//!
//! The driver moves requests from the client's outbox into the service,
//! feeds replies back and fires timers when they are due.

use std::future::Future;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::fs::Fs;
use crate::service::{Response, Service};

pub struct Driver<S: Service> {
    fs: Fs,
    service: S,
    replies_tx: mpsc::UnboundedSender<Response>,
    replies_rx: mpsc::UnboundedReceiver<Response>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

impl<S: Service> Driver<S> {
    pub fn new(fs: Fs, service: S) -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Self {
            fs,
            service,
            replies_tx,
            replies_rx,
        }
    }

    pub fn fs(&self) -> &Fs {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut Fs {
        &mut self.fs
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn into_parts(self) -> (Fs, S) {
        (self.fs, self.service)
    }

    /// Hand every queued request to the service
    fn flush(&mut self) -> bool {
        let mut sent = false;
        while let Some(request) = self.fs.poll_request() {
            trace!(?request, "Dispatching request");
            self.service.dispatch(request, &self.replies_tx);
            sent = true;
        }
        sent
    }

    /// Feed replies that are already waiting
    fn drain_replies(&mut self) -> bool {
        let mut received = false;
        while let Ok(response) = self.replies_rx.try_recv() {
            self.fs.handle_response(response);
            received = true;
        }
        received
    }

    /// Run until no request is queued and no reply is outstanding
    ///
    /// Downloads and searches still waiting for blocks from the network do
    /// not keep this from returning.
    pub async fn run_until_idle(&mut self) {
        loop {
            let sent = self.flush();
            let received = self.drain_replies();
            if sent || received {
                continue;
            }
            if self.fs.is_idle() {
                return;
            }
            let deadline = self.fs.next_deadline();
            tokio::select! {
                Some(response) = self.replies_rx.recv() => self.fs.handle_response(response),
                _ = sleep_until(deadline) => self.fs.tick(Instant::now()),
            }
        }
    }

    /// Run until `shutdown` completes, then suspend every operation
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Driver started");
        loop {
            self.flush();
            let deadline = self.fs.next_deadline();
            tokio::select! {
                Some(response) = self.replies_rx.recv() => self.fs.handle_response(response),
                _ = sleep_until(deadline) => self.fs.tick(Instant::now()),
                _ = &mut shutdown => {
                    debug!("Shutdown requested");
                    break;
                }
            }
        }
        self.fs.suspend_all();
        self.flush();
        info!("Driver stopped");
    }
}
