//! Packet-filter adapter.
//!
//! [`IptablesCommand`] drives the `iptables` and `iptables-restore`
//! binaries. Every call waits for the xtables lock (`-w`) and calls from one
//! adapter are serialised. [`MemoryIptables`] keeps tables in memory with the
//! same observable behaviour, for tests and dry runs.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::IptablesError;
use crate::rules::Rule;

#[async_trait]
pub trait IpTables: Send + Sync {
    /// Rules of `chain` in `iptables -S` form.
    async fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, IptablesError>;

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;

    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;

    /// Delete the first rule in `chain` equal to `rule`.
    async fn delete(&self, table: &str, chain: &str, rule: &Rule) -> Result<(), IptablesError>;

    /// Insert `rules` starting at 1-based `position`, keeping their order.
    async fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rules: &[Rule],
    ) -> Result<(), IptablesError>;

    async fn bulk_append(&self, table: &str, chain: &str, rules: &[Rule]) -> Result<(), IptablesError>;
}

#[async_trait]
impl<T: IpTables + ?Sized> IpTables for Arc<T> {
    async fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, IptablesError> {
        (**self).list(table, chain).await
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        (**self).new_chain(table, chain).await
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        (**self).clear_chain(table, chain).await
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        (**self).delete_chain(table, chain).await
    }

    async fn delete(&self, table: &str, chain: &str, rule: &Rule) -> Result<(), IptablesError> {
        (**self).delete(table, chain, rule).await
    }

    async fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rules: &[Rule],
    ) -> Result<(), IptablesError> {
        (**self).bulk_insert(table, chain, position, rules).await
    }

    async fn bulk_append(&self, table: &str, chain: &str, rules: &[Rule]) -> Result<(), IptablesError> {
        (**self).bulk_append(table, chain, rules).await
    }
}

/// Runs the real `iptables` binaries.
#[derive(Debug)]
pub struct IptablesCommand {
    iptables: PathBuf,
    restore: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl Default for IptablesCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl IptablesCommand {
    /// Use `iptables` and `iptables-restore` from `PATH`.
    pub fn new() -> Self {
        Self::with_programs("iptables", "iptables-restore")
    }

    pub fn with_programs(iptables: impl Into<PathBuf>, restore: impl Into<PathBuf>) -> Self {
        Self {
            iptables: iptables.into(),
            restore: restore.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, IptablesError> {
        let _guard = self.lock.lock().await;
        debug!(args = %args.join(" "), "iptables");

        let output = Command::new(&self.iptables)
            .arg("-w")
            .args(args)
            .output()
            .await
            .map_err(|source| IptablesError::Spawn {
                program: self.iptables.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(IptablesError::Failed {
                command: format!("iptables {}", args.join(" ")),
                status: output.status.to_string(),
                output: combined(&output.stdout, &output.stderr),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn restore(&self, input: String) -> Result<(), IptablesError> {
        let _guard = self.lock.lock().await;
        debug!(%input, "iptables-restore");

        let spawn_error = |source| IptablesError::Spawn {
            program: self.restore.display().to_string(),
            source,
        };

        let mut child = Command::new(&self.restore)
            .args(["--noflush", "-w"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await.map_err(spawn_error)?;
        }
        let output = child.wait_with_output().await.map_err(spawn_error)?;

        if !output.status.success() {
            return Err(IptablesError::Failed {
                command: "iptables-restore --noflush".into(),
                status: output.status.to_string(),
                output: combined(&output.stdout, &output.stderr),
            });
        }
        Ok(())
    }
}

fn combined(stdout: &[u8], stderr: &[u8]) -> String {
    let mut out = String::from_utf8_lossy(stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(stdout);
    if !stdout.trim().is_empty() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(stdout.trim());
    }
    out
}

/// `iptables-restore` input applying `lines` to `table`.
fn restore_input(table: &str, lines: impl IntoIterator<Item = String>) -> String {
    let mut input = format!("*{table}\n");
    for line in lines {
        input.push_str(&line);
        input.push('\n');
    }
    input.push_str("COMMIT\n");
    input
}

/// `rule` as one `iptables-restore` line fragment.
///
/// Tokens that are empty or hold whitespace or quotes are double-quoted so
/// that restore splits the line back into the same tokens.
fn restore_rule(rule: &Rule) -> String {
    rule.tokens()
        .iter()
        .map(|token| {
            let plain = !token.is_empty()
                && !token
                    .chars()
                    .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\'));
            if plain {
                return token.clone();
            }
            let mut quoted = String::with_capacity(token.len() + 2);
            quoted.push('"');
            for c in token.chars() {
                if c == '"' || c == '\\' {
                    quoted.push('\\');
                }
                quoted.push(c);
            }
            quoted.push('"');
            quoted
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl IpTables for IptablesCommand {
    async fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, IptablesError> {
        let stdout = self.run(&["-t", table, "-S", chain]).await?;
        Ok(stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(String::from)
            .collect())
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.run(&["-t", table, "-N", chain]).await.map(drop)
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.run(&["-t", table, "-F", chain]).await.map(drop)
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.run(&["-t", table, "-X", chain]).await.map(drop)
    }

    async fn delete(&self, table: &str, chain: &str, rule: &Rule) -> Result<(), IptablesError> {
        let mut args = vec!["-t", table, "-D", chain];
        args.extend(rule.tokens().iter().map(String::as_str));
        self.run(&args).await.map(drop)
    }

    async fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rules: &[Rule],
    ) -> Result<(), IptablesError> {
        if rules.is_empty() {
            return Ok(());
        }
        let lines = rules
            .iter()
            .zip(position..)
            .map(|(rule, pos)| format!("-I {chain} {pos} {}", restore_rule(rule)));
        self.restore(restore_input(table, lines)).await
    }

    async fn bulk_append(&self, table: &str, chain: &str, rules: &[Rule]) -> Result<(), IptablesError> {
        if rules.is_empty() {
            return Ok(());
        }
        let lines = rules
            .iter()
            .map(|rule| format!("-A {chain} {}", restore_rule(rule)));
        self.restore(restore_input(table, lines)).await
    }
}

const BUILTIN_CHAINS: [&str; 3] = ["INPUT", "FORWARD", "OUTPUT"];

/// In-memory packet filter.
///
/// Starts with the built-in `filter` chains. Operations fail the way
/// iptables does: unknown chains, duplicate chains, deleting a chain that
/// still has rules or is still jumped to. A failure can be injected for the
/// next call of a named operation with [`MemoryIptables::fail_next`].
#[derive(Debug)]
pub struct MemoryIptables {
    tables: Mutex<BTreeMap<(String, String), Vec<Rule>>>,
    failures: Mutex<Vec<&'static str>>,
    calls: Mutex<Vec<String>>,
}

impl Default for MemoryIptables {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIptables {
    pub fn new() -> Self {
        let tables = BUILTIN_CHAINS
            .iter()
            .map(|chain| (("filter".to_string(), chain.to_string()), Vec::new()))
            .collect();
        Self {
            tables: Mutex::new(tables),
            failures: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make the next call of `operation` (e.g. `"bulk_append"`) fail.
    pub fn fail_next(&self, operation: &'static str) {
        lock(&self.failures).push(operation);
    }

    /// Rules currently in `chain`, or `None` if it does not exist.
    pub fn rules(&self, table: &str, chain: &str) -> Option<Vec<Rule>> {
        lock(&self.tables).get(&key(table, chain)).cloned()
    }

    /// Names of all chains in `table`, sorted.
    pub fn chains(&self, table: &str) -> Vec<String> {
        lock(&self.tables)
            .keys()
            .filter(|(t, _)| t == table)
            .map(|(_, chain)| chain.clone())
            .collect()
    }

    /// Operations performed so far, as `"<op> <table> <chain>"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn begin(&self, operation: &'static str, table: &str, chain: &str) -> Result<(), IptablesError> {
        lock(&self.calls).push(format!("{operation} {table} {chain}"));

        let mut failures = lock(&self.failures);
        if let Some(idx) = failures.iter().position(|op| *op == operation) {
            failures.remove(idx);
            return Err(failed(operation, "injected failure"));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key(table: &str, chain: &str) -> (String, String) {
    (table.to_string(), chain.to_string())
}

fn failed(command: &str, output: &str) -> IptablesError {
    IptablesError::Failed {
        command: command.to_string(),
        status: "exit status: 1".into(),
        output: output.to_string(),
    }
}

fn missing_chain() -> IptablesError {
    failed("iptables", "No chain/target/match by that name.")
}

#[async_trait]
impl IpTables for MemoryIptables {
    async fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, IptablesError> {
        self.begin("list", table, chain)?;
        let tables = lock(&self.tables);
        let rules = tables.get(&key(table, chain)).ok_or_else(missing_chain)?;

        let header = if BUILTIN_CHAINS.contains(&chain) {
            format!("-P {chain} ACCEPT")
        } else {
            format!("-N {chain}")
        };
        Ok(std::iter::once(header)
            .chain(rules.iter().map(|rule| format!("-A {chain} {rule}")))
            .collect())
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.begin("new_chain", table, chain)?;
        let mut tables = lock(&self.tables);
        if tables.contains_key(&key(table, chain)) {
            return Err(failed("iptables", "Chain already exists."));
        }
        tables.insert(key(table, chain), Vec::new());
        Ok(())
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.begin("clear_chain", table, chain)?;
        lock(&self.tables)
            .get_mut(&key(table, chain))
            .ok_or_else(missing_chain)?
            .clear();
        Ok(())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.begin("delete_chain", table, chain)?;
        let mut tables = lock(&self.tables);
        let rules = tables.get(&key(table, chain)).ok_or_else(missing_chain)?;
        if !rules.is_empty() {
            return Err(failed("iptables", "Directory not empty."));
        }

        let referenced: HashSet<_> = tables
            .iter()
            .filter(|((t, _), _)| t == table)
            .flat_map(|(_, rules)| rules.iter())
            .filter_map(jump_target)
            .collect();
        if referenced.contains(chain) {
            return Err(failed("iptables", "Too many links."));
        }

        tables.remove(&key(table, chain));
        Ok(())
    }

    async fn delete(&self, table: &str, chain: &str, rule: &Rule) -> Result<(), IptablesError> {
        self.begin("delete", table, chain)?;
        let mut tables = lock(&self.tables);
        let rules = tables.get_mut(&key(table, chain)).ok_or_else(missing_chain)?;
        let idx = rules.iter().position(|r| r == rule).ok_or_else(|| {
            failed("iptables", "Bad rule (does a matching rule exist in that chain?).")
        })?;
        rules.remove(idx);
        Ok(())
    }

    async fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rules: &[Rule],
    ) -> Result<(), IptablesError> {
        self.begin("bulk_insert", table, chain)?;
        let mut tables = lock(&self.tables);
        check_targets(&tables, table, rules)?;
        let existing = tables.get_mut(&key(table, chain)).ok_or_else(missing_chain)?;

        let start = (position.max(1) as usize - 1).min(existing.len());
        existing.splice(start..start, rules.iter().cloned());
        Ok(())
    }

    async fn bulk_append(&self, table: &str, chain: &str, rules: &[Rule]) -> Result<(), IptablesError> {
        self.begin("bulk_append", table, chain)?;
        let mut tables = lock(&self.tables);
        check_targets(&tables, table, rules)?;
        tables
            .get_mut(&key(table, chain))
            .ok_or_else(missing_chain)?
            .extend(rules.iter().cloned());
        Ok(())
    }
}

/// The chain a `-j`/`--jump`/`-g`/`--goto` rule targets.
fn jump_target(rule: &Rule) -> Option<&str> {
    let tokens = rule.tokens();
    tokens
        .iter()
        .position(|t| matches!(t.as_str(), "-j" | "--jump" | "-g" | "--goto"))
        .and_then(|idx| tokens.get(idx + 1))
        .map(String::as_str)
}

const TARGETS: [&str; 6] = ["ACCEPT", "DROP", "REJECT", "RETURN", "LOG", "MARK"];

fn check_targets(
    tables: &BTreeMap<(String, String), Vec<Rule>>,
    table: &str,
    rules: &[Rule],
) -> Result<(), IptablesError> {
    for rule in rules {
        if let Some(target) = jump_target(rule)
            && !TARGETS.contains(&target)
            && !tables.contains_key(&key(table, target))
        {
            return Err(failed("iptables-restore", "Couldn't load target"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jump(chain: &str) -> Rule {
        Rule::new(["-j", chain])
    }

    #[test]
    fn restore_input_wraps_lines_in_table() {
        let input = restore_input("filter", ["-A c1 -j ACCEPT".to_string(), "-A c1 -j REJECT".to_string()]);
        assert_eq!(input, "*filter\n-A c1 -j ACCEPT\n-A c1 -j REJECT\nCOMMIT\n");
    }

    #[tokio::test]
    async fn memory_chain_lifecycle() {
        let ipt = MemoryIptables::new();
        ipt.new_chain("filter", "c1").await.unwrap();
        ipt.bulk_append("filter", "c1", &[Rule::new(["-p", "tcp", "-j", "ACCEPT"])])
            .await
            .unwrap();
        ipt.bulk_insert("filter", "FORWARD", 1, &[jump("c1")]).await.unwrap();

        assert_eq!(
            ipt.list("filter", "FORWARD").await.unwrap(),
            vec!["-P FORWARD ACCEPT", "-A FORWARD -j c1"]
        );
        assert_eq!(
            ipt.list("filter", "c1").await.unwrap(),
            vec!["-N c1", "-A c1 -p tcp -j ACCEPT"]
        );

        assert!(ipt.delete_chain("filter", "c1").await.is_err());
        ipt.clear_chain("filter", "c1").await.unwrap();
        assert!(ipt.delete_chain("filter", "c1").await.is_err());
        ipt.delete("filter", "FORWARD", &jump("c1")).await.unwrap();
        ipt.delete_chain("filter", "c1").await.unwrap();

        assert_eq!(ipt.chains("filter"), vec!["FORWARD", "INPUT", "OUTPUT"]);
    }

    #[tokio::test]
    async fn memory_insert_keeps_order_at_position() {
        let ipt = MemoryIptables::new();
        let a = Rule::new(["-j", "ACCEPT"]);
        let b = Rule::new(["-j", "DROP"]);
        let c = Rule::new(["-j", "REJECT"]);
        ipt.bulk_append("filter", "INPUT", &[a.clone()]).await.unwrap();
        ipt.bulk_insert("filter", "INPUT", 1, &[b.clone(), c.clone()]).await.unwrap();
        assert_eq!(ipt.rules("filter", "INPUT").unwrap(), vec![b, c, a]);
    }

    #[tokio::test]
    async fn memory_rejects_unknown_chains_and_targets() {
        let ipt = MemoryIptables::new();
        assert!(ipt.list("filter", "nope").await.is_err());
        assert!(ipt.bulk_append("filter", "nope", &[jump("ACCEPT")]).await.is_err());
        assert!(ipt.bulk_insert("filter", "FORWARD", 1, &[jump("nope")]).await.is_err());
        ipt.new_chain("filter", "c1").await.unwrap();
        assert!(ipt.new_chain("filter", "c1").await.is_err());
    }

    #[tokio::test]
    async fn memory_injected_failure_fires_once() {
        let ipt = MemoryIptables::new();
        ipt.fail_next("new_chain");
        assert!(ipt.new_chain("filter", "c1").await.is_err());
        ipt.new_chain("filter", "c1").await.unwrap();
        assert_eq!(ipt.calls(), vec!["new_chain filter c1", "new_chain filter c1"]);
    }

    #[test]
    fn restore_lines_keep_tokens_intact() {
        let rule = Rule::new([
            "-m",
            "comment",
            "--comment",
            "allow web",
            "-j",
            "ACCEPT",
        ]);
        assert_eq!(
            restore_rule(&rule),
            r#"-m comment --comment "allow web" -j ACCEPT"#
        );

        let odd = Rule::new(["--comment", r#"say "hi"\now"#, "--log-prefix", ""]);
        assert_eq!(restore_rule(&odd), r#"--comment "say \"hi\"\\now" --log-prefix """#);

        assert_eq!(restore_rule(&jump("c1")), "-j c1");
    }

    #[cfg(unix)]
    mod command {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        /// Write an executable shell script that records its arguments
        /// (and stdin, for restore) to `log`.
        fn fake_program(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn adapter(dir: &Path, iptables_body: &str) -> (IptablesCommand, PathBuf) {
            let log = dir.join("calls.log");
            let iptables = fake_program(
                dir,
                "iptables",
                &format!("echo \"$@\" >> {}\n{iptables_body}", log.display()),
            );
            let restore = fake_program(
                dir,
                "iptables-restore",
                &format!("echo \"restore $@\" >> {0}\ncat >> {0}", log.display()),
            );
            (IptablesCommand::with_programs(iptables, restore), log)
        }

        #[tokio::test]
        async fn passes_wait_flag_and_table() {
            let dir = tempfile::tempdir().unwrap();
            let (ipt, log) = adapter(dir.path(), "");

            ipt.new_chain("filter", "vpa--local-1700000000").await.unwrap();
            ipt.delete("filter", "FORWARD", &jump("vpa--local-1700000000"))
                .await
                .unwrap();
            ipt.clear_chain("filter", "vpa--local-1700000000").await.unwrap();
            ipt.delete_chain("filter", "vpa--local-1700000000").await.unwrap();

            let calls = std::fs::read_to_string(log).unwrap();
            assert_eq!(
                calls,
                "-w -t filter -N vpa--local-1700000000\n\
                 -w -t filter -D FORWARD -j vpa--local-1700000000\n\
                 -w -t filter -F vpa--local-1700000000\n\
                 -w -t filter -X vpa--local-1700000000\n"
            );
        }

        #[tokio::test]
        async fn bulk_operations_go_through_restore() {
            let dir = tempfile::tempdir().unwrap();
            let (ipt, log) = adapter(dir.path(), "");

            ipt.bulk_append(
                "filter",
                "c1",
                &[
                    Rule::new(["-p", "tcp", "-m", "comment", "--comment", "allow web", "-j", "ACCEPT"]),
                    Rule::new(["-j", "REJECT"]),
                ],
            )
            .await
            .unwrap();
            ipt.bulk_insert("filter", "FORWARD", 1, &[jump("c1")]).await.unwrap();
            ipt.bulk_append("filter", "c1", &[]).await.unwrap();

            let calls = std::fs::read_to_string(log).unwrap();
            assert_eq!(
                calls,
                "restore --noflush -w\n*filter\n\
                 -A c1 -p tcp -m comment --comment \"allow web\" -j ACCEPT\n-A c1 -j REJECT\nCOMMIT\n\
                 restore --noflush -w\n*filter\n-I FORWARD 1 -j c1\nCOMMIT\n"
            );
        }

        #[tokio::test]
        async fn list_returns_lines() {
            let dir = tempfile::tempdir().unwrap();
            let (ipt, _) = adapter(
                dir.path(),
                "printf -- '-P FORWARD ACCEPT\\n-A FORWARD -j vpa--local-1700000000\\n'",
            );

            assert_eq!(
                ipt.list("filter", "FORWARD").await.unwrap(),
                vec!["-P FORWARD ACCEPT", "-A FORWARD -j vpa--local-1700000000"]
            );
        }

        #[tokio::test]
        async fn failure_carries_command_and_output() {
            let dir = tempfile::tempdir().unwrap();
            let (ipt, _) = adapter(dir.path(), "echo 'iptables: Chain already exists.' >&2\nexit 1");

            let err = ipt.new_chain("filter", "c1").await.unwrap_err();
            let message = err.to_string();
            assert!(message.contains("iptables -t filter -N c1"), "{message}");
            assert!(message.contains("Chain already exists."), "{message}");
        }

        #[tokio::test]
        async fn missing_binary_is_a_spawn_error() {
            let ipt = IptablesCommand::with_programs("/nonexistent/iptables", "/nonexistent/iptables-restore");
            assert!(matches!(
                ipt.new_chain("filter", "c1").await,
                Err(IptablesError::Spawn { .. })
            ));
            assert!(matches!(
                ipt.bulk_append("filter", "c1", &[jump("ACCEPT")]).await,
                Err(IptablesError::Spawn { .. })
            ));
        }
    }
}
