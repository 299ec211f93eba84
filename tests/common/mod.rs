//! Loopback topologies shared by the integration and load tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ocpp_netcore::transport::LoopbackNetwork;
use ocpp_netcore::{Adapter, AdapterSettings, NodeId};

pub fn node(raw: &str) -> NodeId {
    NodeId::new(raw).unwrap()
}

pub struct Mesh {
    pub network: Arc<LoopbackNetwork>,
    settings: AdapterSettings,
}

impl Mesh {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            network: LoopbackNetwork::new(),
            settings: AdapterSettings {
                default_timeout,
                sweep_interval: Duration::from_millis(10),
                ..AdapterSettings::default()
            },
        }
    }

    /// Joins `id` to the network with an attached adapter.
    pub fn spawn(&self, id: &str) -> Adapter {
        let (transport, events) = self.network.join(node(id));
        let adapter = Adapter::new(node(id), self.settings.clone(), transport);
        adapter.attach(events);
        adapter
    }

    /// Links two adapters and waits until both routers see the connection.
    pub async fn link(&self, a: &Adapter, b: &Adapter) {
        self.network.link(a.local(), b.local());
        wait_until(|| a.router().is_connected(b.local()) && b.router().is_connected(a.local())).await;
    }

    pub async fn unlink(&self, a: &Adapter, b: &Adapter) {
        self.network.unlink(a.local(), b.local());
        wait_until(|| !a.router().is_connected(b.local()) && !b.router().is_connected(a.local())).await;
    }

    /// `CSMS <-> NN01 <-> CS001`, with CSMS reaching CS001 through NN01 and
    /// CS001 using NN01 as its uplink.
    pub async fn chain(&self) -> (Adapter, Adapter, Adapter) {
        let csms = self.spawn("CSMS");
        let nn01 = self.spawn("NN01");
        let cs001 = self.spawn("CS001");
        csms.router().add_route(node("CS001"), node("NN01"));
        cs001.router().set_default_route(Some(node("NN01")));
        self.link(&csms, &nn01).await;
        self.link(&nn01, &cs001).await;
        (csms, nn01, cs001)
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}
