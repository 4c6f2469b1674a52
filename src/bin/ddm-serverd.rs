//! Application-server daemon entry point. Reads a single JSON config path
//! from argv (no bundled CLI argument parser, per spec.md §1's non-goals),
//! wires up the inventory, lock-source pollers, and the mutual-TLS socket
//! server, following the teacher's `env_logger`-at-`main()` convention.

use std::path::PathBuf;
use std::rc::Rc;

use ddm_core::config::RootConfig;
use ddm_core::inventory::Inventory;
use ddm_core::server::auth::{Authorizer, UserIdentitySource};
use ddm_core::server::Server;

/// A placeholder identity source that trusts every certificate DN as its
/// own user name. A real deployment replaces this with a mapping backed by
/// its own user database (out of scope, spec.md §1 non-goal).
struct TrustedDnAsUserName;

impl UserIdentitySource for TrustedDnAsUserName {
    fn resolve(&self, dn: &str) -> Option<String> {
        Some(dn.to_string())
    }
}

/// A placeholder authorizer that grants every identified user access to
/// every service. A real deployment replaces this with a role/service
/// mapping (out of scope, spec.md §1 non-goal).
struct AllowAllServices;

impl Authorizer for AllowAllServices {
    fn authorize(&self, _user: &str, _service: &str) -> bool {
        true
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args().nth(1).map(PathBuf::from).ok_or_else(|| {
        anyhow::anyhow!("usage: ddm-serverd <config.json>")
    })?;
    let config = RootConfig::load(&config_path)?;

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let inventory = Rc::new(Inventory::new(false));
        let server = Server::new(config.server, inventory.clone(), Box::new(TrustedDnAsUserName), Box::new(AllowAllServices));

        if !config.lock_sources.is_empty() {
            let client = ddm_core::tools::http::SimpleHttp::new()?;
            tokio::task::spawn_local(ddm_core::lock_source::run_forever(inventory, client, config.lock_sources));
        }

        server.run().await
    })
}
