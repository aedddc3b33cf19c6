//! End-to-end cluster scenarios over an in-memory transport. Every node is
//! a real manager task; messages are delivered by feeding them into the
//! destination's handle, exactly as an embedding server would.

use async_trait::async_trait;
use bytes::Bytes;
use conclave::{
    BootstrapEntry, Config, Endpoint, Handle, LeaderElection, MembershipManager, Message,
    Transport,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

type Registry = Arc<Mutex<HashMap<Endpoint, Handle>>>;

struct SimTransport {
    endpoint: Endpoint,
    registry: Registry,
}

#[async_trait]
impl Transport for SimTransport {
    type Error = std::io::Error;

    async fn send_to_neighbor(&mut self, dst: Endpoint, msg: Message) -> Result<(), Self::Error> {
        let handle = {
            let registry = self.registry.lock().unwrap();
            registry.get(&dst).cloned()
        };

        match handle {
            Some(handle) => handle
                .incoming(msg)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no route",
            )),
        }
    }

    async fn send_to_all(&mut self, msg: Message) -> (usize, usize) {
        let neighbors: Vec<Handle> = {
            let registry = self.registry.lock().unwrap();
            registry
                .iter()
                .filter(|(endpoint, _)| **endpoint != self.endpoint)
                .map(|(_, handle)| handle.clone())
                .collect()
        };

        let total = neighbors.len();
        let deliveries = neighbors.iter().map(|handle| handle.incoming(msg.clone()));
        let sent = futures::future::join_all(deliveries)
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count();
        (sent, total)
    }
}

fn endpoint_of(name: &str) -> Endpoint {
    format!("sim://{}", name)
}

fn config(name: &str, peers: &[&str], seed: u64) -> Config {
    let mut cfg = Config::new(name, endpoint_of(name));
    cfg.incarnation = 1;
    cfg.seed = Some(seed);
    cfg.gossip_interval = Duration::from_millis(10);
    cfg.bootstrap = peers
        .iter()
        .map(|peer| BootstrapEntry::named(*peer, endpoint_of(peer)))
        .collect();
    cfg
}

fn spawn_node(registry: &Registry, cfg: Config) -> Handle {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let endpoint = cfg.endpoint.clone();
    let transport = SimTransport {
        endpoint: endpoint.clone(),
        registry: registry.clone(),
    };
    let handle = MembershipManager::spawn(cfg, transport);
    registry.lock().unwrap().insert(endpoint, handle.clone());
    handle
}

async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

async fn view_names(handle: &Handle) -> Vec<String> {
    let mut names: Vec<String> = handle
        .members()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.name)
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn two_nodes_discover_each_other() {
    let registry: Registry = Default::default();
    let a = spawn_node(&registry, config("node-a", &["node-b"], 1));
    let b = spawn_node(&registry, config("node-b", &["node-a"], 2));

    eventually("both views converge", || async {
        view_names(&a).await == ["node-a", "node-b"]
            && view_names(&b).await == ["node-a", "node-b"]
    })
    .await;
}

#[tokio::test]
async fn blind_bootstrap_endpoint_is_discovered() {
    let registry: Registry = Default::default();

    // node-a only knows an endpoint, not who answers there.
    let mut cfg_a = config("node-a", &[], 3);
    cfg_a.bootstrap = vec![BootstrapEntry::nameless(endpoint_of("node-b"))];
    let a = spawn_node(&registry, cfg_a);
    let _b = spawn_node(&registry, config("node-b", &[], 4));

    eventually("blind probe resolves the peer", || async {
        view_names(&a).await == ["node-a", "node-b"]
    })
    .await;
}

#[tokio::test]
async fn attributes_propagate_and_tombstone() {
    let registry: Registry = Default::default();
    let a = spawn_node(&registry, config("node-a", &["node-b"], 5));
    let b = spawn_node(&registry, config("node-b", &["node-a"], 6));

    eventually("views converge", || async {
        view_names(&b).await == ["node-a", "node-b"]
    })
    .await;

    assert!(a
        .set_attribute("role", Bytes::from_static(b"router"))
        .await
        .unwrap());

    eventually("attribute reaches the peer", || async {
        b.members()
            .await
            .unwrap()
            .iter()
            .find(|m| m.name == "node-a")
            .map_or(false, |m| {
                m.attributes.get("role").map(Bytes::as_ref) == Some(b"router".as_ref())
            })
    })
    .await;

    // The deletion must propagate too, not just fade away locally.
    assert!(a.remove_attribute("role").await.unwrap());

    eventually("tombstone reaches the peer", || async {
        b.members()
            .await
            .unwrap()
            .iter()
            .find(|m| m.name == "node-a")
            .map_or(false, |m| !m.attributes.contains_key("role"))
    })
    .await;
}

#[tokio::test]
async fn suspected_node_rebuts_and_rejoins() {
    let registry: Registry = Default::default();
    let a = spawn_node(&registry, config("node-a", &["node-b"], 7));
    let b = spawn_node(&registry, config("node-b", &["node-a"], 8));

    eventually("views converge", || async {
        view_names(&a).await == ["node-a", "node-b"]
            && view_names(&b).await == ["node-a", "node-b"]
    })
    .await;

    let before = b
        .members()
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.name == "node-b")
        .unwrap()
        .version;

    // In a two-node view a single reporter confirms the suspicion, so
    // node-b drops out of node-a's view until it rebuts.
    a.report_suspect("node-b").await.unwrap();

    eventually("rebuttal restores the node with a newer version", || async {
        a.members()
            .await
            .unwrap()
            .iter()
            .find(|m| m.name == "node-b")
            .map_or(false, |m| m.version > before)
    })
    .await;
}

#[tokio::test]
async fn duplicate_incarnation_drops_the_stale_one() {
    let registry: Registry = Default::default();
    let a = spawn_node(&registry, config("node-a", &["node-b"], 9));
    let _b = spawn_node(&registry, config("node-b", &["node-a"], 10));

    eventually("views converge", || async {
        view_names(&a).await == ["node-a", "node-b"]
    })
    .await;

    // A second life of node-b was observed elsewhere; the stale entry goes
    // away without waiting for suspicion to accumulate.
    a.report_duplicate_node("node-b", 99).await.unwrap();

    eventually("stale incarnation leaves the view", || async {
        view_names(&a).await == ["node-a"]
    })
    .await;
}

#[tokio::test]
async fn three_candidates_elect_the_lowest_name() {
    let registry: Registry = Default::default();
    let names = ["node-a", "node-b", "node-c"];
    let mut nodes = Vec::new();
    let observed: Arc<Mutex<HashMap<String, Option<String>>>> = Default::default();

    for (i, name) in names.iter().enumerate() {
        let peers: Vec<&str> = names.iter().filter(|n| *n != name).copied().collect();
        let mut cfg = config(name, &peers, 11 + i as u64);
        cfg.election_candidate = true;
        cfg.election_warmup = Duration::from_millis(300);
        let handle = spawn_node(&registry, cfg.clone());
        nodes.push((cfg, handle));
    }

    // Let the views converge before anyone may claim, so the warmup is
    // spent propagating candidacies rather than discovering peers.
    for (_, handle) in &nodes {
        eventually("views converge", || async {
            view_names(handle).await == names
        })
        .await;
    }

    let mut elections = Vec::new();
    for (cfg, handle) in &nodes {
        let slot = observed.clone();
        let me = cfg.node_name.clone();
        let election = LeaderElection::spawn(
            handle.clone(),
            cfg,
            move |leader: Option<&str>| {
                slot.lock()
                    .unwrap()
                    .insert(me.clone(), leader.map(str::to_owned));
            },
        );
        elections.push(election);
    }

    eventually("everyone agrees on the lowest-named leader", || async {
        let observed = observed.lock().unwrap();
        names
            .iter()
            .all(|n| observed.get(*n) == Some(&Some("node-a".to_string())))
    })
    .await;

    for election in elections {
        election.close().await.unwrap();
    }
}

#[tokio::test]
async fn acked_leave_removes_the_node() {
    let registry: Registry = Default::default();
    let a = spawn_node(&registry, config("node-a", &["node-b"], 20));
    let b = spawn_node(&registry, config("node-b", &["node-a"], 21));

    eventually("views converge", || async {
        view_names(&a).await == ["node-a", "node-b"]
            && view_names(&b).await == ["node-a", "node-b"]
    })
    .await;

    let acked = b
        .terminate(true, true, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(acked);

    eventually("the leaver is gone from the peer's view", || async {
        view_names(&a).await == ["node-a"]
    })
    .await;
}
