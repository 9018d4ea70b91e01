//! The root or satellite coordinator: partitions hatchling configs across
//! colonies, hosts the bus server they call home to, and aggregates the
//! Reports they upload.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::{BusClient, BusServer};
use crate::error::SwarmResult;
use crate::partition::{partition_plan, required_colony_count, PartitionLimits};
use crate::report::Report;

const CENTRAL_STATS_FORWARD_TIMEOUT: Duration = Duration::from_secs(3);
const SATELLITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const SATELLITE_DRAIN_POLL: Duration = Duration::from_secs(1);

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// `now() + delay_seconds` as a unix timestamp, for CLI callers translating
/// `--launch-delay` into a planned start time.
pub fn unix_seconds_from_now(delay_seconds: u64) -> i64 {
    now_unix() + delay_seconds as i64
}

/// Per-colony bookkeeping: how many hatchlings it was promised, and
/// whether it has already drawn its config slice. Assignment is sticky —
/// once a `client_id` is assigned a share it keeps that share even if it
/// calls `get_colony_config` again.
struct Assignments {
    plan: VecDeque<usize>,
    by_client: HashMap<String, usize>,
}

impl Assignments {
    fn new(plan: Vec<usize>) -> Self {
        Assignments { plan: plan.into(), by_client: HashMap::new() }
    }

    fn assign(&mut self, client_id: &str) -> usize {
        if let Some(&count) = self.by_client.get(client_id) {
            return count;
        }
        let count = self.plan.pop_front().unwrap_or(0);
        self.by_client.insert(client_id.to_string(), count);
        count
    }
}

struct PendingConfigs {
    configs: VecDeque<HashMap<String, String>>,
}

impl PendingConfigs {
    fn take(&mut self, count: usize) -> Vec<HashMap<String, String>> {
        let count = count.min(self.configs.len());
        self.configs.drain(..count).collect()
    }
}

/// Shared, lock-protected state mutated only from inside bus handlers. The
/// bus serializes handler invocation through its single dispatch task, so
/// one `Mutex` per piece of state is enough — there is never contention
/// beyond the dispatch loop itself.
struct OvermindState {
    assignments: Assignments,
    pending: PendingConfigs,
    accumulator: Report,
    satellites: HashSet<String>,
    start_time_unix: Option<i64>,
}

pub struct OvermindHandle {
    pub address: String,
    /// Number of colonies the partition plan calls for — the subprocess
    /// manager should spawn exactly this many, not one per CPU slot.
    pub colony_count: usize,
    pub serve: std::pin::Pin<Box<dyn std::future::Future<Output = SwarmResult<()>> + Send>>,
    state: Arc<Mutex<OvermindState>>,
}

/// A cheap, cloneable, `'static` handle onto the Overmind's shared state,
/// independent of [`OvermindHandle`] itself. Callers that need to spawn
/// `handle.serve` (a partial move out of the handle) should grab one of
/// these first — everything it exposes borrows only the shared `Mutex`,
/// never the handle as a whole, so it keeps working after `serve` is gone.
#[derive(Clone)]
pub struct AccumulatorView(Arc<Mutex<OvermindState>>);

impl AccumulatorView {
    pub async fn peek(&self) -> Report {
        self.0.lock().await.accumulator.clone()
    }

    pub async fn set_start_time(&self, unix_seconds: i64) {
        self.0.lock().await.start_time_unix = Some(unix_seconds);
    }

    pub async fn peek_start_time(&self) -> Option<i64> {
        self.0.lock().await.start_time_unix
    }

    /// Waits for every registered satellite to unregister, polling once a
    /// second, up to a 5-minute ceiling — after which the Overmind gives up
    /// and proceeds with whatever results it already has.
    pub async fn wait_for_satellite_drain(&self) {
        let deadline = tokio::time::Instant::now() + SATELLITE_DRAIN_TIMEOUT;
        loop {
            let empty = self.0.lock().await.satellites.is_empty();
            if empty {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("timed out waiting for satellites to drain");
                return;
            }
            tokio::time::sleep(SATELLITE_DRAIN_POLL).await;
        }
    }
}

/// Namespace for the Overmind's construction entry point; the live
/// coordinator state lives in [`OvermindHandle`] once `bind` returns.
pub struct Overmind;

impl Overmind {
    /// Computes the partition plan and wires up the bus handlers. Pass a
    /// `central` client when running as a satellite reporting upstream.
    pub async fn bind(
        address: &str,
        hatchling_configs: Vec<HashMap<String, String>>,
        slots: usize,
        limits: PartitionLimits,
        central: Option<Arc<BusClient>>,
    ) -> SwarmResult<OvermindHandle> {
        let n = hatchling_configs.len();
        let k = required_colony_count(n, slots, limits);
        let plan = partition_plan(n, k);
        info!(n, slots, k, "overmind computed partition plan");

        let state = Arc::new(Mutex::new(OvermindState {
            assignments: Assignments::new(plan),
            pending: PendingConfigs { configs: hatchling_configs.into() },
            accumulator: Report::new(),
            satellites: HashSet::new(),
            // The planned colony-launch time, absent any `--launch-delay` or
            // central override, is "right now" — matching the zero-delay
            // default in §6's CLI surface.
            start_time_unix: Some(now_unix()),
        }));

        let mut server = BusServer::new();
        Self::register_handlers(&mut server, state.clone(), central.clone());

        let (qualified, serve) = server.bind(address).await?;

        Ok(OvermindHandle { address: qualified, colony_count: k, serve: Box::pin(serve), state })
    }

    fn register_handlers(server: &mut BusServer, state: Arc<Mutex<OvermindState>>, central: Option<Arc<BusClient>>) {
        let handler_state = state.clone();
        server.register_callback("get_colony_config", move |payload| {
            let state = handler_state.clone();
            async move {
                let mut state = state.lock().await;
                let hatchlings = state.assignments.assign(&payload.client_id);
                Ok(json!({ "hatchlings": hatchlings }))
            }
        });

        let handler_state = state.clone();
        server.register_callback("get_hatchlings_config", move |payload| {
            let state = handler_state.clone();
            async move {
                let mut state = state.lock().await;
                let count = state.assignments.by_client.get(&payload.client_id).copied().unwrap_or(0);
                let configs = state.pending.take(count);
                Ok(json!({ "configs": configs }))
            }
        });

        let handler_state = state.clone();
        server.register_callback("stats", move |payload| {
            let state = handler_state.clone();
            let central = central.clone();
            async move {
                if let Some(central) = &central {
                    let forward = central.call("stats", payload.data.clone());
                    if tokio::time::timeout(CENTRAL_STATS_FORWARD_TIMEOUT, forward).await.is_err() {
                        let error = "timeout while forwarding stats to central overmind";
                        warn!(error, "stats forward failed");
                        return Ok(json!({
                            "client_id": payload.client_id,
                            "data": { "stats": "error", "error": error },
                        }));
                    }
                }
                let reported = Report::from_dict(&payload.data);
                let mut state = state.lock().await;
                state.accumulator += reported;
                Ok(json!({ "result": "ok" }))
            }
        });

        let handler_state = state.clone();
        server.register_callback("satellite_action", move |payload| {
            let state = handler_state.clone();
            async move {
                let action = payload.data.get("action").and_then(Value::as_str).unwrap_or_default();
                let mut state = state.lock().await;
                match action {
                    "register" => {
                        state.satellites.insert(payload.client_id.clone());
                        Ok(json!({ "result": "ok", "start": state.start_time_unix }))
                    }
                    "unregister" => {
                        state.satellites.remove(&payload.client_id);
                        Ok(json!({ "result": "ok" }))
                    }
                    other => Ok(json!({ "result": "error", "error": format!("unknown satellite action '{other}'") })),
                }
            }
        });
    }
}

impl OvermindHandle {
    /// Sets the planned start time handed out to satellites that register
    /// after this point. Called once with `now + launch_delay` right after
    /// binding, and again if a central overmind hands back its own start
    /// time in reply to `satellite_action { action: "register" }`.
    pub async fn set_start_time(&self, unix_seconds: i64) {
        self.accumulator_view().set_start_time(unix_seconds).await;
    }

    /// The currently planned start time, if one has been set.
    pub async fn peek_start_time(&self) -> Option<i64> {
        self.accumulator_view().peek_start_time().await
    }

    /// Waits for every registered satellite to unregister, polling once a
    /// second, up to a 5-minute ceiling — after which the Overmind gives up
    /// and proceeds with whatever results it already has.
    pub async fn wait_for_satellite_drain(&self) {
        self.accumulator_view().wait_for_satellite_drain().await;
    }

    /// Snapshot of the current accumulator without resetting it, for
    /// optional periodic intermediate reporting.
    pub async fn peek_accumulator(&self) -> Report {
        self.accumulator_view().peek().await
    }

    /// A cheap, owned, `'static` handle onto the shared state, independent
    /// of this handle's lifetime. Grab one of these *before* spawning
    /// `handle.serve` (which partially moves the handle) if you still need
    /// to call start-time or satellite-drain methods afterward.
    pub fn accumulator_view(&self) -> AccumulatorView {
        AccumulatorView(self.state.clone())
    }
}

/// Sleeps until the given unix timestamp, or returns immediately if it has
/// already passed. Satellite startup choreography (§4.6): "on register,
/// adopt the central's start time; sleep until then; then spawn colonies."
pub async fn sleep_until_unix(unix_seconds: i64) {
    let delta = unix_seconds - now_unix();
    if delta > 0 {
        tokio::time::sleep(Duration::from_secs(delta as u64)).await;
    }
}

/// Prints the accumulator every `interval` until cancelled, without ever
/// resetting it. No-op if `interval <= 1 minute`, per the "when > 1" rule.
pub async fn run_intermediate_reporting(view: AccumulatorView, interval: Duration) {
    if interval <= Duration::from_secs(60) {
        return;
    }
    loop {
        tokio::time::sleep(interval).await;
        let snapshot = view.peek().await;
        info!("{}", snapshot.render());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusClient;

    fn sample_configs(n: usize) -> Vec<HashMap<String, String>> {
        (0..n)
            .map(|i| {
                let mut cfg = HashMap::new();
                cfg.insert("username".to_string(), format!("user{i}"));
                cfg
            })
            .collect()
    }

    #[tokio::test]
    async fn colony_config_assignment_is_sticky_and_exhausts_the_plan() {
        let handle = Overmind::bind(
            "127.0.0.1:0",
            sample_configs(4),
            2,
            PartitionLimits { min_per_colony: 1, max_per_colony: 10 },
            None,
        )
        .await
        .unwrap();
        let address = handle.address.clone();
        tokio::spawn(handle.serve);

        let first = BusClient::connect(&address).await.unwrap();
        let reply = first.call("get_colony_config", json!({})).await.unwrap();
        let first_count = reply["hatchlings"].as_u64().unwrap();

        let reply_again = first.call("get_colony_config", json!({})).await.unwrap();
        assert_eq!(reply_again["hatchlings"].as_u64().unwrap(), first_count, "assignment must be sticky");

        let second = BusClient::connect(&address).await.unwrap();
        let second_reply = second.call("get_colony_config", json!({})).await.unwrap();
        let second_count = second_reply["hatchlings"].as_u64().unwrap();

        let third = BusClient::connect(&address).await.unwrap();
        let third_reply = third.call("get_colony_config", json!({})).await.unwrap();
        assert_eq!(third_reply["hatchlings"].as_u64().unwrap(), 0, "plan is exhausted after 2 colonies");

        assert_eq!(first_count + second_count, 4);
    }

    #[tokio::test]
    async fn hatchlings_config_delivery_is_disjoint_and_one_shot() {
        let handle = Overmind::bind(
            "127.0.0.1:0",
            sample_configs(4),
            2,
            PartitionLimits { min_per_colony: 1, max_per_colony: 10 },
            None,
        )
        .await
        .unwrap();
        let address = handle.address.clone();
        tokio::spawn(handle.serve);

        let colony_a = BusClient::connect(&address).await.unwrap();
        let colony_b = BusClient::connect(&address).await.unwrap();
        colony_a.call("get_colony_config", json!({})).await.unwrap();
        colony_b.call("get_colony_config", json!({})).await.unwrap();

        let configs_a = colony_a.call("get_hatchlings_config", json!({})).await.unwrap();
        let configs_b = colony_b.call("get_hatchlings_config", json!({})).await.unwrap();

        let names_a: HashSet<String> = configs_a["configs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["username"].as_str().unwrap().to_string())
            .collect();
        let names_b: HashSet<String> = configs_b["configs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["username"].as_str().unwrap().to_string())
            .collect();
        assert!(names_a.is_disjoint(&names_b));
        assert_eq!(names_a.len() + names_b.len(), 4);

        // A second fetch for the same colony finds the pool already drained.
        let repeat = colony_a.call("get_hatchlings_config", json!({})).await.unwrap();
        assert!(repeat["configs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_handler_merges_into_accumulator() {
        let handle = Overmind::bind(
            "127.0.0.1:0",
            sample_configs(1),
            1,
            PartitionLimits::default(),
            None,
        )
        .await
        .unwrap();
        let address = handle.address.clone();
        let state = handle.state.clone();
        tokio::spawn(handle.serve);

        let mut report = Report::new();
        report.add_success("home", 0.2);
        let client = BusClient::connect(&address).await.unwrap();
        let reply = client.call("stats", report.to_dict()).await.unwrap();
        assert_eq!(reply["result"], "ok");

        let accumulated = state.lock().await.accumulator.clone();
        assert_eq!(accumulated.to_dict()["success"]["home"]["count"], 1);
    }

    #[tokio::test]
    async fn stats_forward_timeout_skips_the_local_merge_and_reports_the_error() {
        // A wedged central: accepts the connection and never replies, so the
        // forwarding call trips CENTRAL_STATS_FORWARD_TIMEOUT.
        let central_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let central_addr = central_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = central_listener.accept().await;
            std::future::pending::<()>().await;
        });
        let central = Arc::new(BusClient::connect(&format!("127.0.0.1:{}", central_addr.port())).await.unwrap());

        let handle = Overmind::bind(
            "127.0.0.1:0",
            sample_configs(1),
            1,
            PartitionLimits::default(),
            Some(central),
        )
        .await
        .unwrap();
        let address = handle.address.clone();
        let state = handle.state.clone();
        tokio::spawn(handle.serve);

        let mut report = Report::new();
        report.add_success("home", 0.2);
        let client = BusClient::connect(&address).await.unwrap();
        let reply = client.call("stats", report.to_dict()).await.unwrap();

        assert_eq!(reply["data"]["stats"], "error");
        assert!(reply["data"]["error"].as_str().unwrap().contains("timeout"));

        let accumulated = state.lock().await.accumulator.clone();
        assert!(accumulated.to_dict()["success"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn satellite_register_hands_back_the_planned_start_time() {
        let handle = Overmind::bind(
            "127.0.0.1:0",
            sample_configs(1),
            1,
            PartitionLimits::default(),
            None,
        )
        .await
        .unwrap();
        let address = handle.address.clone();
        let control = handle.accumulator_view();
        tokio::spawn(handle.serve);

        let planned = now_unix() + 3600;
        control.set_start_time(planned).await;

        let satellite = BusClient::connect(&address).await.unwrap();
        let reply = satellite
            .call("satellite_action", json!({ "action": "register" }))
            .await
            .unwrap();
        assert_eq!(reply["start"].as_i64(), Some(planned));

        let unregister = satellite.call("satellite_action", json!({ "action": "unregister" })).await.unwrap();
        assert_eq!(unregister["result"], "ok");
    }

    #[tokio::test]
    async fn sleep_until_unix_returns_immediately_for_a_past_deadline() {
        let started = tokio::time::Instant::now();
        sleep_until_unix(now_unix() - 10).await;
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
