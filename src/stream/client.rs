//! Per-handler stream client.
//!
//! Owns one feed per KV host that serves at least one of this consumer's
//! vbs, opened lazily on the first vb that needs the host. Every feed's
//! frames are forwarded into one aggregated channel so the dispatch loop
//! observes a total order per vb and per host.

use crate::config::ConsumerIdentity;
use crate::stream::cluster::ClusterView;
use crate::stream::event::{FeedEvent, StreamRequest};
use crate::stream::feed::{FeedCommand, FeedTransport, StreamError};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Vbs with a stream request issued and not yet ended; shared with the
/// dispatch loop which prunes it on STREAMEND.
pub type VbStreamRequested = Arc<RwLock<HashSet<u16>>>;

pub struct StreamClient {
    transport: Arc<dyn FeedTransport>,
    cluster: Arc<dyn ClusterView>,
    identity: ConsumerIdentity,
    bucket: String,
    agg_tx: mpsc::Sender<FeedEvent>,
    host_feeds: RwLock<AHashMap<String, mpsc::UnboundedSender<FeedCommand>>>,
    /// Which host each open vb streams from.
    vb_feed_host: RwLock<AHashMap<u16, String>>,
    vb_stream_requested: VbStreamRequested,
    stop: watch::Receiver<bool>,
}

impl StreamClient {
    pub fn new(
        transport: Arc<dyn FeedTransport>,
        cluster: Arc<dyn ClusterView>,
        identity: ConsumerIdentity,
        bucket: &str,
        agg_tx: mpsc::Sender<FeedEvent>,
        vb_stream_requested: VbStreamRequested,
        stop: watch::Receiver<bool>,
    ) -> Self {
        StreamClient {
            transport,
            cluster,
            identity,
            bucket: bucket.to_string(),
            agg_tx,
            host_feeds: RwLock::new(AHashMap::new()),
            vb_feed_host: RwLock::new(AHashMap::new()),
            vb_stream_requested,
            stop,
        }
    }

    pub fn vb_stream_requested(&self) -> VbStreamRequested {
        self.vb_stream_requested.clone()
    }

    /// Issue a stream request for one vb; the result arrives on the
    /// aggregated channel as a `StreamReq` event.
    pub async fn request_stream(
        &self,
        vb: u16,
        vbuuid: u64,
        start_seq: u64,
    ) -> Result<(), StreamError> {
        let kv_map = self.cluster.kv_vb_map();
        let host = kv_map
            .get(&vb)
            .cloned()
            .ok_or(StreamError::NoHostForVb(vb))?;

        self.cleanup_stale_feeds(&kv_map);

        let control = match self.feed_for(&host).await {
            Ok(control) => control,
            Err(err) => {
                warn!(vb, %host, %err, "feed connect failed");
                return Err(err);
            }
        };

        self.vb_stream_requested.write().insert(vb);
        self.vb_feed_host.write().insert(vb, host.clone());

        info!(vb, %host, vbuuid, start_seq, "stream start");
        let request = StreamRequest::open_ended(vb, vbuuid, start_seq);
        if control
            .send(FeedCommand::StreamRequest(request))
            .is_err()
        {
            self.drop_feed(&host);
            self.vb_stream_requested.write().remove(&vb);
            return Err(StreamError::Disconnected(host));
        }
        Ok(())
    }

    /// Close one vb's stream; the server answers with STREAMEND.
    pub fn close_stream(&self, vb: u16) {
        let host = self.vb_feed_host.read().get(&vb).cloned();
        if let Some(host) = host {
            if let Some(control) = self.host_feeds.read().get(&host) {
                let _ = control.send(FeedCommand::CloseStream(vb));
            }
        }
    }

    /// Tear down the feed of one host; end-of-stream markers for its vbs
    /// arrive on the aggregated channel.
    pub fn close_feed(&self, host: &str) {
        if let Some(control) = self.host_feeds.write().remove(host) {
            let _ = control.send(FeedCommand::CloseFeed);
        }
        self.vb_feed_host
            .write()
            .retain(|_, feed_host| feed_host != host);
    }

    /// Close every feed (teardown).
    pub fn close_all(&self) {
        let hosts: Vec<String> = self.host_feeds.read().keys().cloned().collect();
        for host in hosts {
            self.close_feed(&host);
        }
    }

    /// Drop feeds for hosts that no longer serve any of our vbs; returns
    /// the vbs that were streaming from those hosts so the caller can
    /// clear their ownership metadata.
    pub fn cleanup_stale_feeds(&self, kv_map: &AHashMap<u16, String>) -> Vec<u16> {
        let live_hosts: HashSet<&String> = kv_map.values().collect();
        let stale: Vec<String> = self
            .host_feeds
            .read()
            .keys()
            .filter(|host| !live_hosts.contains(host))
            .cloned()
            .collect();

        let mut orphaned = Vec::new();
        for host in stale {
            debug!(%host, "closing stale feed");
            orphaned.extend(
                self.vb_feed_host
                    .read()
                    .iter()
                    .filter(|(_, feed_host)| **feed_host == host)
                    .map(|(vb, _)| *vb),
            );
            self.close_feed(&host);
        }
        orphaned.sort_unstable();
        orphaned
    }

    fn drop_feed(&self, host: &str) {
        self.host_feeds.write().remove(host);
    }

    /// Get or lazily open the feed for a host, spawning its aggregator.
    async fn feed_for(
        &self,
        host: &str,
    ) -> Result<mpsc::UnboundedSender<FeedCommand>, StreamError> {
        if let Some(control) = self.host_feeds.read().get(host) {
            return Ok(control.clone());
        }

        let feed_name = format!(
            "eventing:{}_{}_{}",
            self.identity.host_port, host, self.identity.worker_name
        );
        let feed = self.transport.connect(host, &feed_name).await?;
        info!(host, bucket = %self.bucket, %feed_name, "feed opened");

        let control = feed.control.clone();
        self.host_feeds
            .write()
            .insert(host.to_string(), control.clone());

        // Aggregator: forward this feed's frames into the shared channel
        // until the feed closes or the consumer stops.
        let agg_tx = self.agg_tx.clone();
        let mut events = feed.events;
        let mut stop = self.stop.clone();
        let feed_host = host.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(event) => {
                                if agg_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            None => {
                                debug!(host = %feed_host, "feed events channel closed");
                                return;
                            }
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::cluster::StaticClusterView;
    use crate::stream::event::StreamReqStatus;
    use crate::stream::feed::SimulatedTransport;

    fn identity() -> ConsumerIdentity {
        ConsumerIdentity {
            host_port: "127.0.0.1:8096".to_string(),
            node_uuid: "uuid-a".to_string(),
            worker_name: "worker_app_0".to_string(),
        }
    }

    struct Fixture {
        client: StreamClient,
        transport: Arc<SimulatedTransport>,
        cluster: Arc<StaticClusterView>,
        agg_rx: mpsc::Receiver<FeedEvent>,
        _stop_tx: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let transport = SimulatedTransport::new();
        let cluster = StaticClusterView::new();
        let (agg_tx, agg_rx) = mpsc::channel(128);
        let (stop_tx, stop_rx) = watch::channel(false);
        let client = StreamClient::new(
            transport.clone(),
            cluster.clone(),
            identity(),
            "default",
            agg_tx,
            Arc::new(RwLock::new(HashSet::new())),
            stop_rx,
        );
        Fixture {
            client,
            transport,
            cluster,
            agg_rx,
            _stop_tx: stop_tx,
        }
    }

    #[tokio::test]
    async fn lazy_connect_and_aggregated_success() {
        let mut fx = fixture();
        fx.cluster.assign_vbs("kv1:11210", 0..8);
        fx.transport.host("kv1:11210").accept_all(7);

        fx.client.request_stream(5, 7, 100).await.unwrap();
        let event = fx.agg_rx.recv().await.unwrap();
        assert!(matches!(
            event,
            FeedEvent::StreamReq {
                vb: 5,
                status: StreamReqStatus::Success,
                ..
            }
        ));

        let requests = fx.transport.host("kv1:11210").take_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].start_seq, 100);
        assert_eq!(requests[0].snap_end, 100);
        assert!(fx.client.vb_stream_requested.read().contains(&5));
    }

    #[tokio::test]
    async fn one_feed_per_host() {
        let fx = fixture();
        fx.cluster.assign_vbs("kv1:11210", 0..4);
        fx.cluster.assign_vbs("kv2:11210", 4..8);
        fx.transport.host("kv1:11210").accept_all(1);
        fx.transport.host("kv2:11210").accept_all(1);

        fx.client.request_stream(0, 1, 0).await.unwrap();
        fx.client.request_stream(1, 1, 0).await.unwrap();
        fx.client.request_stream(6, 1, 0).await.unwrap();

        assert_eq!(fx.client.host_feeds.read().len(), 2);
    }

    #[tokio::test]
    async fn missing_host_is_an_error() {
        let fx = fixture();
        let err = fx.client.request_stream(3, 1, 0).await.unwrap_err();
        assert!(matches!(err, StreamError::NoHostForVb(3)));
    }

    #[tokio::test]
    async fn close_stream_yields_stream_end() {
        let mut fx = fixture();
        fx.cluster.assign_vbs("kv1:11210", 0..8);
        fx.transport.host("kv1:11210").accept_all(1);

        fx.client.request_stream(2, 1, 0).await.unwrap();
        fx.agg_rx.recv().await.unwrap(); // success

        fx.client.close_stream(2);
        let event = fx.agg_rx.recv().await.unwrap();
        assert_eq!(event, FeedEvent::StreamEnd { vb: 2 });
    }

    #[tokio::test]
    async fn stale_feed_cleanup_reports_orphans() {
        let mut fx = fixture();
        fx.cluster.assign_vbs("kv1:11210", 0..8);
        fx.transport.host("kv1:11210").accept_all(1);
        fx.client.request_stream(3, 1, 0).await.unwrap();
        fx.agg_rx.recv().await.unwrap();

        // The vb moves to a host we have no feed for yet.
        fx.cluster.assign_vbs("kv2:11210", 0..8);
        let orphaned = fx.client.cleanup_stale_feeds(&fx.cluster.kv_vb_map());
        assert_eq!(orphaned, vec![3]);
        assert!(fx.client.host_feeds.read().is_empty());
    }
}
