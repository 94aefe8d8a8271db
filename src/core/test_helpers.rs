//! Shared test utilities for core module tests
//!
//! Provides fakes for every collaborator of [`NatService`] so lifecycle and
//! resync scenarios run without iptables, Proxmox or a disk. This module is
//! only compiled in test mode.

use crate::core::codec::IptablesCodec;
use crate::core::executor::{CommandExecutor, CommandFailure, CommandOutcome};
use crate::core::firewall::NatFirewall;
use crate::core::lifecycle::NatService;
use crate::core::locator::{ContainerLocator, ContainerStatus};
use crate::core::rule::{NatRule, Protocol, RuleDraft, RuleId};
use crate::core::store::{JsonRuleStore, RuleAmendment, RuleFilter, RuleStore, StoreError};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("NATKEEPER_IPTABLES_COMMAND", "ip netns exec fw iptables");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("NATKEEPER_IPTABLES_COMMAND");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Service wired to fakes, as used by the scenario tests
pub type TestService = NatService<JsonRuleStore, FakeLocator, FakeIptables>;

/// Creates an enabled tcp rule pointing at 10.0.0.5.
pub fn create_test_rule(id: RuleId, node: &str, vmid: u32, host_port: u16, container_port: u16) -> NatRule {
    NatRule {
        id,
        node: node.to_string(),
        vmid,
        host_port,
        container_port,
        protocol: Protocol::Tcp,
        container_ip_at_creation: "10.0.0.5".parse().unwrap(),
        description: None,
        enabled: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Renders an add/remove argv the way `iptables -S` prints the entry.
///
/// Everything from the `-A`/`-D` token on is kept, with the action shown as
/// `-A` and arguments containing anything but printable ASCII quoted.
pub fn render_dump_line(argv: &[String]) -> String {
    let start = argv
        .iter()
        .position(|a| a == "-A" || a == "-D")
        .expect("argv has no -A/-D action");

    let mut parts = vec!["-A".to_string()];
    for arg in &argv[start + 1..] {
        let plain = !arg.is_empty()
            && arg
                .chars()
                .all(|c| c.is_ascii_graphic() && c != '"' && c != '\\');
        if plain {
            parts.push(arg.clone());
        } else {
            parts.push(format!(
                "\"{}\"",
                arg.replace('\\', "\\\\").replace('"', "\\\"")
            ));
        }
    }
    parts.join(" ")
}

#[derive(Debug, Default)]
struct FakeTable {
    lines: Vec<String>,
    calls: Vec<Vec<String>>,
    fail_adds: bool,
    fail_removes: bool,
    fail_list: bool,
    fail_add_ports: HashSet<u16>,
    delay: Option<Duration>,
}

/// In-memory iptables PREROUTING chain.
///
/// `-A` appends the rendered line, `-D` deletes an identical line or fails
/// with "Bad rule" like the real binary, `-S` prints the chain. Every
/// invocation is recorded. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeIptables {
    table: Arc<Mutex<FakeTable>>,
}

impl FakeIptables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts a line in the chain without recording a call
    pub fn seed_line(&self, line: &str) {
        self.table.lock().unwrap().lines.push(line.to_string());
    }

    pub fn lines(&self) -> Vec<String> {
        self.table.lock().unwrap().lines.clone()
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.table.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.table.lock().unwrap().calls.clear();
    }

    /// Recorded calls whose action token is `action` (`-A`, `-D` or `-S`)
    pub fn calls_with_action(&self, action: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| argv.iter().any(|a| a == action))
            .collect()
    }

    pub fn set_fail_adds(&self, fail: bool) {
        self.table.lock().unwrap().fail_adds = fail;
    }

    pub fn set_fail_removes(&self, fail: bool) {
        self.table.lock().unwrap().fail_removes = fail;
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.table.lock().unwrap().fail_list = fail;
    }

    /// Makes every call take `delay` before it runs
    pub fn set_delay(&self, delay: Duration) {
        self.table.lock().unwrap().delay = Some(delay);
    }

    /// Makes `-A` fail only for entries on this host port
    pub fn fail_adds_for_port(&self, host_port: u16) {
        self.table.lock().unwrap().fail_add_ports.insert(host_port);
    }
}

fn argument_after<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
    argv.iter()
        .position(|a| a == flag)
        .and_then(|i| argv.get(i + 1))
        .map(String::as_str)
}

impl CommandExecutor for FakeIptables {
    async fn invoke(&self, argv: &[String], _timeout: Duration) -> CommandOutcome {
        let delay = self.table.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut table = self.table.lock().unwrap();
        table.calls.push(argv.to_vec());

        let exit = |message: &str| CommandOutcome::failed(CommandFailure::Exit(Some(1)), message);

        if argv.iter().any(|a| a == "-S") {
            if table.fail_list {
                return exit("iptables v1.8.9 (legacy): can't initialize iptables table `nat': Permission denied");
            }
            let mut dump = vec!["-P PREROUTING ACCEPT".to_string()];
            dump.extend(table.lines.iter().cloned());
            return CommandOutcome::success(dump.join("\n"));
        }

        if argv.iter().any(|a| a == "-A") {
            let port = argument_after(argv, "--dport").and_then(|p| p.parse::<u16>().ok());
            if table.fail_adds || port.is_some_and(|p| table.fail_add_ports.contains(&p)) {
                return exit("iptables: No chain/target/match by that name.");
            }
            table.lines.push(render_dump_line(argv));
            return CommandOutcome::success("");
        }

        if argv.iter().any(|a| a == "-D") {
            if table.fail_removes {
                return exit("iptables: Resource temporarily unavailable.");
            }
            let line = render_dump_line(argv);
            return match table.lines.iter().position(|l| *l == line) {
                Some(index) => {
                    table.lines.remove(index);
                    CommandOutcome::success("")
                }
                None => exit("iptables: Bad rule (does a matching rule exist in that chain?)."),
            };
        }

        CommandOutcome::failed(CommandFailure::Exit(Some(2)), "unsupported fake iptables call")
    }
}

/// Container facts keyed by `(node, vmid)`. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeLocator {
    containers: Arc<Mutex<HashMap<(String, u32), (Option<IpAddr>, Option<ContainerStatus>)>>>,
}

impl FakeLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a running container at `ip`
    pub fn add_running(&self, node: &str, vmid: u32, ip: &str) {
        self.containers.lock().unwrap().insert(
            (node.to_string(), vmid),
            (Some(ip.parse().unwrap()), Some(ContainerStatus::running())),
        );
    }

    pub fn set_ip(&self, node: &str, vmid: u32, ip: Option<&str>) {
        let mut containers = self.containers.lock().unwrap();
        let entry = containers.entry((node.to_string(), vmid)).or_default();
        entry.0 = ip.map(|ip| ip.parse().unwrap());
    }

    pub fn set_status(&self, node: &str, vmid: u32, status: &str) {
        let mut containers = self.containers.lock().unwrap();
        let entry = containers.entry((node.to_string(), vmid)).or_default();
        entry.1 = Some(ContainerStatus {
            status: status.to_string(),
        });
    }
}

impl ContainerLocator for FakeLocator {
    async fn container_ip(&self, node: &str, vmid: u32) -> Option<IpAddr> {
        self.containers
            .lock()
            .unwrap()
            .get(&(node.to_string(), vmid))
            .and_then(|(ip, _)| *ip)
    }

    async fn container_status(&self, node: &str, vmid: u32) -> Option<ContainerStatus> {
        self.containers
            .lock()
            .unwrap()
            .get(&(node.to_string(), vmid))
            .and_then(|(_, status)| status.clone())
    }
}

/// In-memory store whose writes can be made to fail on demand
#[derive(Debug)]
pub struct FlakyStore {
    inner: JsonRuleStore,
    fail_updates: AtomicBool,
    fail_amend_many: AtomicBool,
    fail_deletes: AtomicBool,
    /// Row another writer commits just before our next create or update
    rival: Mutex<Option<RuleDraft>>,
}

impl Default for FlakyStore {
    fn default() -> Self {
        Self {
            inner: JsonRuleStore::in_memory(),
            fail_updates: AtomicBool::new(false),
            fail_amend_many: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            rival: Mutex::new(None),
        }
    }
}

impl FlakyStore {
    /// Lets another writer take `host_port/tcp` between the caller's
    /// conflict check and its commit.
    pub fn claim_slot_before_next_write(&self, host_port: u16) {
        *self.rival.lock().unwrap() = Some(RuleDraft {
            node: "rival".to_string(),
            vmid: 900,
            host_port,
            container_port: 80,
            protocol: Protocol::Tcp,
            container_ip: "10.0.0.99".parse().unwrap(),
            description: None,
            enabled: true,
        });
    }

    async fn admit_rival(&self) {
        let rival = self.rival.lock().unwrap().take();
        if let Some(draft) = rival {
            self.inner.create(draft).await.unwrap();
        }
    }

    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_amend_many(&self, fail: bool) {
        self.fail_amend_many.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("disk full".to_string())
    }
}

impl RuleStore for FlakyStore {
    async fn get(&self, id: RuleId) -> Result<Option<NatRule>, StoreError> {
        self.inner.get(id).await
    }

    async fn list(
        &self,
        filter: &RuleFilter,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<NatRule>, usize), StoreError> {
        self.inner.list(filter, offset, limit).await
    }

    async fn create(&self, draft: RuleDraft) -> Result<NatRule, StoreError> {
        self.admit_rival().await;
        self.inner.create(draft).await
    }

    async fn update(&self, rule: &NatRule) -> Result<NatRule, StoreError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.admit_rival().await;
        self.inner.update(rule).await
    }

    async fn amend_many(&self, amendments: &[RuleAmendment]) -> Result<usize, StoreError> {
        if self.fail_amend_many.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.amend_many(amendments).await
    }

    async fn delete(&self, id: RuleId) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.delete(id).await
    }
}

fn firewall(fake: &FakeIptables) -> NatFirewall<FakeIptables> {
    NatFirewall::new(fake.clone(), IptablesCodec::default())
}

/// Service over an in-memory store, plus handles to its fakes
pub fn test_service() -> (TestService, FakeIptables, FakeLocator) {
    let fake = FakeIptables::new();
    let locator = FakeLocator::new();
    let service = NatService::new(JsonRuleStore::in_memory(), locator.clone(), firewall(&fake));
    (service, fake, locator)
}

/// Service over a [`FlakyStore`]
pub fn flaky_service() -> (
    NatService<FlakyStore, FakeLocator, FakeIptables>,
    FakeIptables,
    FakeLocator,
) {
    let fake = FakeIptables::new();
    let locator = FakeLocator::new();
    let service = NatService::new(FlakyStore::default(), locator.clone(), firewall(&fake));
    (service, fake, locator)
}
