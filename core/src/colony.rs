//! The per-process worker: fetches its assignment from the Overmind,
//! instantiates hatchlings, runs their task mixes, and periodically
//! uploads statistics.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::bus::BusClient;
use crate::error::{SwarmError, SwarmResult};
use crate::hatchling::{build_shared_client, run_lifecycle, HatcheryRegistry, SharedRuntime};
use crate::report::Report;

const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

pub struct Colony {
    bus_address: String,
    hatchery_name: String,
    registry: HatcheryRegistry,
}

impl Colony {
    pub fn new(
        bus_address: impl Into<String>,
        hatchery_name: impl Into<String>,
        registry: HatcheryRegistry,
    ) -> Self {
        Colony { bus_address: bus_address.into(), hatchery_name: hatchery_name.into(), registry }
    }

    /// Pins the whole colony to one OS thread: a current-thread Tokio
    /// runtime plus a `LocalSet`, so the process-wide Report accumulator
    /// and the hatchling task futures can stay `!Send` and lock-free.
    pub fn run(self) -> SwarmResult<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| SwarmError::Other(err.into()))?;
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, self.run_async())
    }

    async fn run_async(self) -> SwarmResult<()> {
        let client = BusClient::connect(&self.bus_address).await?;
        client.session_register().await;

        let result = self.fetch_and_run(&client).await;

        client.session_unregister().await;
        result
    }

    async fn fetch_and_run(&self, client: &BusClient) -> SwarmResult<()> {
        let colony_config = client
            .call("get_colony_config", json!({}))
            .await
            .ok_or_else(|| SwarmError::BusCallFailed { message_type: "get_colony_config".into() })?;
        let hatchling_count = colony_config
            .get("hatchlings")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        if hatchling_count == 0 {
            return Err(SwarmError::NoHatchlingsAssigned);
        }

        let configs_reply = client
            .call("get_hatchlings_config", json!({}))
            .await
            .ok_or_else(|| SwarmError::BusCallFailed { message_type: "get_hatchlings_config".into() })?;
        let configs: Vec<HashMap<String, String>> = configs_reply
            .get("configs")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        if configs.len() != hatchling_count {
            return Err(SwarmError::HatchlingConfigCountMismatch {
                got: configs.len(),
                expected: hatchling_count,
            });
        }

        info!(hatchlings = hatchling_count, "colony starting task mix");

        let report = Rc::new(RefCell::new(Report::new()));
        let http_client =
            build_shared_client().map_err(|err| SwarmError::Other(anyhow::Error::new(err)))?;
        let shared = SharedRuntime { client: http_client, report: report.clone() };

        let mut hatchlings = Vec::with_capacity(configs.len());
        for config in configs {
            hatchlings.push(self.registry.build(&self.hatchery_name, config, shared.clone())?);
        }

        let task_runner = async {
            let lifecycles = hatchlings.iter().map(|hatchling| run_lifecycle(hatchling.tasks()));
            futures::future::join_all(lifecycles).await
        };

        tokio::pin!(task_runner);
        let stats_reporter = Self::report_loop(client, &report);
        tokio::pin!(stats_reporter);

        tokio::select! {
            results = &mut task_runner => {
                for result in results {
                    if let Err(err) = result {
                        warn!(error = %err, "hatchling lifecycle failed");
                    }
                }
            }
            _ = &mut stats_reporter => {}
        }

        Self::upload_stats(client, &report).await;
        Ok(())
    }

    async fn report_loop(client: &BusClient, report: &Rc<RefCell<Report>>) {
        loop {
            tokio::time::sleep(STATS_REPORT_INTERVAL).await;
            Self::upload_stats(client, report).await;
        }
    }

    async fn upload_stats(client: &BusClient, report: &Rc<RefCell<Report>>) {
        let snapshot = report.borrow_mut().take();
        if client.call("stats", snapshot.to_dict()).await.is_none() {
            debug!("stats upload was not acknowledged; telemetry is best-effort");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::hatchling::{Connection, Hatchling, HatchlingTasksBuilder, RequestOptions};
    use crate::overmind::Overmind;
    use crate::partition::PartitionLimits;

    struct GetOnceHatchling {
        tasks: crate::hatchling::HatchlingTasks,
    }

    impl Hatchling for GetOnceHatchling {
        fn tasks(&self) -> &crate::hatchling::HatchlingTasks {
            &self.tasks
        }
    }

    /// Replies `200 OK` to every request; enough of an HTTP server to
    /// drive `reqwest` through the happy path without pulling in a mock
    /// HTTP crate the teacher never used.
    async fn spawn_http_200(listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .await;
                });
            }
        });
    }

    /// Scenario 6: an Overmind with two colonies worth of hatchlings, each
    /// running one ordered GET that returns 200, ends up with that many
    /// successes and zero errors in the aggregated accumulator.
    #[tokio::test(flavor = "current_thread")]
    async fn end_to_end_accumulates_successes_from_one_colony() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        spawn_http_200(target_listener).await;

        let mut configs = Vec::new();
        for i in 0..4 {
            let mut cfg = HashMap::new();
            cfg.insert("base_url".to_string(), format!("http://{target_addr}"));
            cfg.insert("username".to_string(), format!("user{i}"));
            configs.push(cfg);
        }

        let handle = Overmind::bind(
            "127.0.0.1:0",
            configs,
            1,
            PartitionLimits { min_per_colony: 1, max_per_colony: 10 },
            None,
        )
        .await
        .unwrap();
        let address = handle.address.clone();
        let accumulator_view = handle.accumulator_view();

        let mut registry = HatcheryRegistry::new();
        registry.register(
            "get_once",
            Box::new(|config, runtime| {
                let base_url = config.get("base_url").cloned().unwrap_or_default();
                let connection = Rc::new(Connection::from_shared(&runtime, base_url));
                let conn = connection.clone();
                let tasks = HatchlingTasksBuilder::new()
                    .ordered("home", 0, 1, move || {
                        let conn = conn.clone();
                        async move {
                            conn.do_request(RequestOptions::new(Method::GET, "/home").name("home")).await;
                            Ok(())
                        }
                    })
                    .build();
                Box::new(GetOnceHatchling { tasks }) as Box<dyn Hatchling>
            }),
        );

        let local = tokio::task::LocalSet::new();
        local.spawn_local(handle.serve);
        local
            .run_until(async move {
                let colony = Colony::new(address, "get_once", registry);
                colony.run_async().await.unwrap();
            })
            .await;

        let accumulator = accumulator_view.peek().await;
        assert_eq!(accumulator.to_dict()["success"]["home"]["count"], 4);
        assert!(accumulator.request_errors.is_empty());
        assert!(accumulator.other_errors.is_empty());
    }
}
