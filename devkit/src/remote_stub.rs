/*!
SSH simulé pour tests sans hôte distant

`MockRemoteExecutor` tient un petit système de fichiers par hôte et comprend
les commandes émises par `ConfigOps` (test, cat, cp, tee, chown, chmod, mv,
rm, telegraf --test, systemctl). Les pannes s'injectent par motif de
commande ; connexions et fermetures de session sont comptées.

Comme un vrai client ssh, une ligne de commande au-delà de MAX_ARG_STRLEN
(128 KiB) ne part pas : le contenu volumineux doit passer par stdin.
*/

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use fleet_kernel::error::RemoteError;
use fleet_kernel::models::ResolvedCredential;
use fleet_kernel::remote::{CommandOutput, RemoteExecutor, RemoteSession, SshTarget};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Linux limit on a single argv string.
pub const MAX_ARG_STRLEN: usize = 128 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub content: String,
    pub owner: String,
    pub mode: u32,
}

#[derive(Debug, Clone)]
enum Fault {
    Exit { code: i32, stderr: String },
    Channel(RemoteError),
}

#[derive(Default)]
struct HostState {
    files: BTreeMap<String, RemoteFile>,
    commands: Vec<String>,
    service_actions: Vec<String>,
    test_output: Option<CommandOutput>,
    last_credential: Option<ResolvedCredential>,
}

#[derive(Default)]
struct RemoteState {
    hosts: HashMap<String, HostState>,
    refused: HashMap<String, RemoteError>,
    faults: Vec<(String, Fault)>,
    connects: usize,
    closes: usize,
}

#[derive(Clone, Default)]
pub struct MockRemoteExecutor {
    state: Arc<Mutex<RemoteState>>,
}

impl MockRemoteExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a root-owned `0640` file on the host.
    pub fn put_file(&self, host: &str, path: &str, content: &str) {
        self.state.lock().hosts.entry(host.to_string()).or_default().files.insert(
            path.to_string(),
            RemoteFile {
                content: content.to_string(),
                owner: "root:telegraf".to_string(),
                mode: 0o640,
            },
        );
    }

    pub fn file(&self, host: &str, path: &str) -> Option<RemoteFile> {
        self.state.lock().hosts.get(host).and_then(|h| h.files.get(path).cloned())
    }

    pub fn paths(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .hosts
            .get(host)
            .map(|h| h.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Any command containing `pattern` exits with `code` and `stderr`.
    pub fn fail_command(&self, pattern: &str, code: i32, stderr: &str) {
        self.state.lock().faults.push((
            pattern.to_string(),
            Fault::Exit {
                code,
                stderr: stderr.to_string(),
            },
        ));
    }

    /// Any command containing `pattern` fails at the channel level.
    pub fn break_channel_on(&self, pattern: &str, error: RemoteError) {
        self.state.lock().faults.push((pattern.to_string(), Fault::Channel(error)));
    }

    pub fn refuse_connect(&self, host: &str, error: RemoteError) {
        self.state.lock().refused.insert(host.to_string(), error);
    }

    pub fn set_test_output(&self, host: &str, output: CommandOutput) {
        self.state.lock().hosts.entry(host.to_string()).or_default().test_output = Some(output);
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn open_sessions(&self) -> usize {
        let state = self.state.lock();
        state.connects - state.closes
    }

    pub fn commands(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .hosts
            .get(host)
            .map(|h| h.commands.clone())
            .unwrap_or_default()
    }

    pub fn service_actions(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .hosts
            .get(host)
            .map(|h| h.service_actions.clone())
            .unwrap_or_default()
    }

    pub fn last_credential(&self, host: &str) -> Option<ResolvedCredential> {
        self.state.lock().hosts.get(host).and_then(|h| h.last_credential.clone())
    }
}

#[async_trait]
impl RemoteExecutor for MockRemoteExecutor {
    async fn connect(&self, target: &SshTarget, _timeout: Duration) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let mut state = self.state.lock();
        if let Some(error) = state.refused.get(&target.host) {
            return Err(error.clone());
        }
        state.connects += 1;
        state.hosts.entry(target.host.clone()).or_default().last_credential = Some(target.credential.clone());
        Ok(Box::new(MockSession {
            host: target.host.clone(),
            state: self.state.clone(),
        }))
    }
}

struct MockSession {
    host: String,
    state: Arc<Mutex<RemoteState>>,
}

impl MockSession {
    fn dispatch(&self, command: &str, input: Option<&[u8]>) -> Result<CommandOutput, RemoteError> {
        if command.len() > MAX_ARG_STRLEN {
            return Err(RemoteError::Io(
                "failed to spawn ssh client: Argument list too long (os error 7)".to_string(),
            ));
        }

        let mut state = self.state.lock();
        let fault = state
            .faults
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, fault)| fault.clone());

        let host = state.hosts.entry(self.host.clone()).or_default();
        host.commands.push(command.to_string());

        match fault {
            Some(Fault::Channel(error)) => Err(error),
            Some(Fault::Exit { code, stderr }) => Ok(CommandOutput {
                stdout: String::new(),
                stderr,
                exit_code: code,
            }),
            None => Ok(run(host, command, input.unwrap_or_default())),
        }
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.dispatch(command, None)
    }

    async fn exec_with_input(&mut self, command: &str, input: &[u8]) -> Result<CommandOutput, RemoteError> {
        self.dispatch(command, Some(input))
    }

    async fn close(self: Box<Self>) {
        self.state.lock().closes += 1;
    }
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn failed(code: i32, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code: code,
    }
}

fn run(host: &mut HostState, command: &str, stdin: &[u8]) -> CommandOutput {
    let Ok(words) = shell_words::split(command) else {
        return failed(2, format!("sh: syntax error in `{command}`"));
    };
    let words: Vec<&str> = words.iter().map(String::as_str).collect();

    match words.as_slice() {
        ["true"] => ok(""),
        ["sudo", "test", "-f", path] => {
            if host.files.contains_key(*path) {
                ok("")
            } else {
                failed(1, "")
            }
        }
        ["sudo", "cat", path] => match host.files.get(*path) {
            Some(file) => ok(file.content.clone()),
            None => failed(1, format!("cat: {path}: No such file or directory")),
        },
        ["sudo", "cp", "-p", from, to] => match host.files.get(*from).cloned() {
            Some(file) => {
                host.files.insert(to.to_string(), file);
                ok("")
            }
            None => failed(1, format!("cp: cannot stat '{from}': No such file or directory")),
        },
        ["base64", "-d", "|", "sudo", "tee", path, ">", "/dev/null"] => {
            match BASE64_STANDARD.decode(stdin.trim_ascii()).map(String::from_utf8) {
                Ok(Ok(content)) => {
                    host.files.insert(
                        path.to_string(),
                        RemoteFile {
                            content,
                            owner: "root:root".to_string(),
                            mode: 0o644,
                        },
                    );
                    ok("")
                }
                _ => failed(1, "base64: invalid input"),
            }
        }
        ["sudo", verb @ ("chown" | "chmod"), reference, path] => {
            let Some(reference) = reference.strip_prefix("--reference=") else {
                return failed(1, format!("{verb}: missing operand"));
            };
            let Some(source) = host.files.get(reference).cloned() else {
                return failed(1, format!("{verb}: failed to get attributes of '{reference}'"));
            };
            match host.files.get_mut(*path) {
                Some(file) if *verb == "chown" => {
                    file.owner = source.owner;
                    ok("")
                }
                Some(file) => {
                    file.mode = source.mode;
                    ok("")
                }
                None => failed(1, format!("{verb}: cannot access '{path}': No such file or directory")),
            }
        }
        ["sudo", "mv", "-f", from, to] => match host.files.remove(*from) {
            Some(file) => {
                host.files.insert(to.to_string(), file);
                ok("")
            }
            None => failed(1, format!("mv: cannot stat '{from}': No such file or directory")),
        },
        ["sudo", "rm", "-f", path] => {
            host.files.remove(*path);
            ok("")
        }
        ["sudo", _binary, "--config", path, "--test"] => {
            if let Some(output) = &host.test_output {
                return output.clone();
            }
            if host.files.contains_key(*path) {
                CommandOutput {
                    stdout: "> cpu,host=mock usage_idle=99\n".to_string(),
                    stderr: format!("I! Loading config: {path}\n"),
                    exit_code: 0,
                }
            } else {
                failed(1, format!("E! loading config file {path} failed: no such file"))
            }
        }
        ["sudo", "systemctl", action, _service] => {
            host.service_actions.push(action.to_string());
            ok("")
        }
        _ => failed(127, format!("sh: command not found: {command}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_kernel::config_ops::{encode_payload, write_command};
    use std::net::Ipv4Addr;

    fn target() -> SshTarget {
        SshTarget {
            host: "web-01".into(),
            address: Ipv4Addr::new(10, 0, 0, 5),
            port: 22,
            user: "ops".into(),
            credential: ResolvedCredential::Password("pw".into()),
        }
    }

    #[tokio::test]
    async fn test_fake_filesystem_follows_commands() {
        let remote = MockRemoteExecutor::new();
        remote.put_file("web-01", "/etc/telegraf/telegraf.conf", "[agent]\n");

        let mut session = remote.connect(&target(), Duration::from_secs(1)).await.unwrap();
        let out = session
            .exec_with_input(&write_command("/tmp/t.conf"), &encode_payload("[[inputs.cpu]]\n"))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(remote.file("web-01", "/tmp/t.conf").unwrap().content, "[[inputs.cpu]]\n");

        let out = session
            .exec("sudo chown --reference=/etc/telegraf/telegraf.conf /tmp/t.conf")
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(remote.file("web-01", "/tmp/t.conf").unwrap().owner, "root:telegraf");

        assert_eq!(session.exec("sudo test -f /nope").await.unwrap().exit_code, 1);
        assert_eq!(session.exec("rm -rf /").await.unwrap().exit_code, 127);
        let oversized = format!("echo {}", "x".repeat(MAX_ARG_STRLEN));
        assert!(matches!(session.exec(&oversized).await, Err(RemoteError::Io(_))));
        session.close().await;

        assert_eq!(remote.connect_count(), 1);
        assert_eq!(remote.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_faults_and_refusals() {
        let remote = MockRemoteExecutor::new();
        remote.fail_command("systemctl", 5, "Failed to restart telegraf.service");
        remote.break_channel_on("cat", RemoteError::Io("broken pipe".into()));

        let mut session = remote.connect(&target(), Duration::from_secs(1)).await.unwrap();
        let out = session.exec("sudo systemctl restart telegraf").await.unwrap();
        assert_eq!(out.exit_code, 5);
        assert!(remote.service_actions("web-01").is_empty());
        assert!(session.exec("sudo cat /x").await.is_err());
        session.close().await;

        remote.refuse_connect("web-01", RemoteError::Auth("bad password".into()));
        assert!(matches!(
            remote.connect(&target(), Duration::from_secs(1)).await,
            Err(RemoteError::Auth(_))
        ));
        assert_eq!(remote.connect_count(), 1);
    }
}
