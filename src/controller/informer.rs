//! Informers
//!
//! A watch feed that keeps a reflector store current and tells the
//! controller about every object it sees. The store outlives the feed, so
//! the feed can be stopped and started again (e.g. across leadership terms)
//! without losing the cache.

use futures::StreamExt;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    api: Api<K>,
    writer: Arc<Mutex<Writer<K>>>,
    store: Store<K>,
    synced: Arc<watch::Sender<bool>>,
}

impl<K> Clone for Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            writer: self.writer.clone(),
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn new(api: Api<K>) -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();
        let (synced, _) = watch::channel(false);
        Self {
            api,
            writer: Arc::new(Mutex::new(writer)),
            store,
            synced: Arc::new(synced),
        }
    }

    /// Read side of the cache
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Wait until the first full listing has been applied
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Stream changes into the store until `token` fires.
    ///
    /// `on_event` sees every object that was added, updated or deleted,
    /// and every object of a relisting.
    pub async fn run<F>(&self, token: CancellationToken, mut on_event: F)
    where
        F: FnMut(&K) + Send,
    {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        let mut stream = watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .boxed();

        debug!("Starting {} informer", kind);
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = stream.next() => event,
            };

            match event {
                Some(Ok(event)) => {
                    self.writer.lock().apply_watcher_event(&event);
                    match &event {
                        Event::Applied(obj) | Event::Deleted(obj) => on_event(obj),
                        Event::Restarted(objs) => {
                            self.synced.send_replace(true);
                            objs.iter().for_each(&mut on_event);
                        }
                    }
                }
                Some(Err(e)) => warn!("{} watch error: {}", kind, e),
                None => break,
            }
        }
        debug!("Stopped {} informer", kind);
    }
}
