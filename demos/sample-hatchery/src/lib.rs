//! Reference hatchery: a virtual user that logs in once, hits its home
//! page on a fixed cadence, browses in parallel, and picks between a
//! "browse" and "checkout" action by weighted random choice. Exercises
//! every task discipline `swarm-core`'s scheduler understands, against
//! a target HTTP service supplied via `base_url`.
//!
//! Not part of the control-plane contract — this is the kind of thing a
//! swarm operator links into their own binary, kept here so the crate has
//! something real to register and run end to end.

use std::collections::HashMap;
use std::rc::Rc;

use reqwest::Method;
use swarm_core::hatchling::{
    Connection, HatcheryRegistry, Hatchling, HatchlingTasksBuilder, HatchlingTasks, RequestOptions,
    SharedRuntime,
};

pub struct LoadTestHatchling {
    tasks: HatchlingTasks,
}

impl Hatchling for LoadTestHatchling {
    fn tasks(&self) -> &HatchlingTasks {
        &self.tasks
    }
}

impl LoadTestHatchling {
    pub fn new(config: HashMap<String, String>, runtime: SharedRuntime) -> Self {
        let base_url = config.get("base_url").cloned().unwrap_or_default();
        let username = config.get("username").cloned().unwrap_or_default();
        let connection = Rc::new(Connection::from_shared(&runtime, base_url));

        let setup_conn = connection.clone();
        let setup_username = username.clone();
        let ordered_conn = connection.clone();
        let parallel_conn = connection.clone();
        let browse_conn = connection.clone();
        let checkout_conn = connection.clone();

        let tasks = HatchlingTasksBuilder::new()
            .setup(move || {
                let conn = setup_conn.clone();
                let username = setup_username.clone();
                async move {
                    let opts = RequestOptions::new(Method::POST, "/login")
                        .name("login")
                        .json_data(serde_json::json!({ "username": username }));
                    conn.do_request(opts).await;
                    Ok(())
                }
            })
            .ordered("home", 0, 1, move || {
                let conn = ordered_conn.clone();
                async move {
                    let opts = RequestOptions::new(Method::GET, "/home").name("home");
                    conn.do_request(opts).await;
                    Ok(())
                }
            })
            .parallel("notifications", 2, move || {
                let conn = parallel_conn.clone();
                async move {
                    let opts = RequestOptions::new(Method::GET, "/notifications").name("notifications");
                    conn.do_request(opts).await;
                    Ok(())
                }
            })
            .random("browse", 1, move || {
                let conn = browse_conn.clone();
                async move {
                    let opts = RequestOptions::new(Method::GET, "/products").name("browse");
                    conn.do_request(opts).await;
                    Ok(true)
                }
            })
            .random("checkout", 3, move || {
                let conn = checkout_conn.clone();
                async move {
                    let opts = RequestOptions::new(Method::POST, "/checkout")
                        .name("checkout")
                        .needs_auth(false)
                        .error_status([409]);
                    conn.do_request(opts).await;
                    Ok(true)
                }
            })
            .build();

        LoadTestHatchling { tasks }
    }
}

/// Registers every hatchling this crate knows how to build. A binary that
/// wants to run this scenario calls this once at startup before handing
/// the registry to a [`swarm_core::colony::Colony`].
pub fn register(registry: &mut HatcheryRegistry) {
    registry.register("load_test", Box::new(|config, runtime| {
        Box::new(LoadTestHatchling::new(config, runtime)) as Box<dyn Hatchling>
    }));
}
