//! Typed actions executed by the phases, and their shell rendering.
//!
//! The orchestrator never builds shell text itself. Each phase expands into
//! a list of actions; an executor runs an action's script (fed on stdin, so
//! nothing secret ever appears on a command line) and the action names the
//! failure kind a non-zero exit maps to.

use shell_words::quote;

use crate::domain::{EnvironmentSnapshot, FailureKind, Phase, Trigger};

use super::pipeline::Pipeline;

/// Delimiter of the environment heredoc. Rendered lines always start with
/// `KEY=`, so no line can equal it.
const ENV_HEREDOC: &str = "EGSA_ENV_EOF";

/// One unit of work on the local machine or the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run the test suite (local)
    RunTests { workdir: String, command: String },

    /// Terminate the previous process and wait for the port to free up
    StopProcess {
        pid_file: String,
        port: u16,
        process_pattern: Option<String>,
        grace_seconds: u64,
    },

    /// Delete the checkout and clone the trigger commit fresh
    Checkout {
        repo_url: String,
        branch: String,
        commit: String,
        app_dir: String,
    },

    InstallDependencies { app_dir: String, command: String },

    /// Overwrite the environment file (mode 0600)
    WriteEnvironment { path: String, contents: String },

    Migrate {
        app_dir: String,
        env_file: String,
        command: String,
    },

    CollectStatic {
        app_dir: String,
        env_file: String,
        command: String,
    },

    /// Post-migration management command
    ManagementCommand {
        app_dir: String,
        env_file: String,
        command: String,
    },

    /// Launch the process detached; prints `pid=<n>`
    StartProcess {
        app_dir: String,
        env_file: String,
        command: String,
        pid_file: String,
        app_log: String,
    },
}

impl Action {
    /// Short name for logs and events
    pub fn label(&self) -> &'static str {
        match self {
            Action::RunTests { .. } => "run-tests",
            Action::StopProcess { .. } => "stop-process",
            Action::Checkout { .. } => "checkout",
            Action::InstallDependencies { .. } => "install-dependencies",
            Action::WriteEnvironment { .. } => "write-environment",
            Action::Migrate { .. } => "migrate",
            Action::CollectStatic { .. } => "collect-static",
            Action::ManagementCommand { .. } => "management-command",
            Action::StartProcess { .. } => "start-process",
        }
    }

    /// Failure kind a non-zero exit of this action maps to
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Action::RunTests { .. } => FailureKind::Test,
            Action::StopProcess { .. } => FailureKind::ProcessStop,
            Action::Checkout { .. } => FailureKind::Connectivity,
            Action::InstallDependencies { .. } => FailureKind::DependencyInstall,
            Action::WriteEnvironment { .. } => FailureKind::Environment,
            Action::Migrate { .. }
            | Action::CollectStatic { .. }
            | Action::ManagementCommand { .. } => FailureKind::Migration,
            Action::StartProcess { .. } => FailureKind::ProcessStart,
        }
    }

    /// Render the script an executor feeds to the shell
    pub fn script(&self) -> String {
        match self {
            Action::RunTests { workdir, command } => {
                format!("set -e\ncd {}\n{}\n", quote(workdir), command)
            }
            Action::StopProcess {
                pid_file,
                port,
                process_pattern,
                grace_seconds,
            } => stop_script(pid_file, *port, process_pattern.as_deref(), *grace_seconds),
            Action::Checkout {
                repo_url,
                branch,
                commit,
                app_dir,
            } => {
                let dir = quote(app_dir);
                let mut s = String::new();
                s.push_str(&format!("rm -rf {}\n", dir));
                s.push_str(&format!(
                    "git clone --quiet --branch {} {} {}\n",
                    quote(branch),
                    quote(repo_url),
                    dir
                ));
                s.push_str(&format!(
                    "git -C {} checkout --quiet --detach {}\n",
                    dir,
                    quote(commit)
                ));
                s.push_str(&format!("echo \"checked out $(git -C {} rev-parse HEAD)\"\n", dir));
                s
            }
            Action::InstallDependencies { app_dir, command } => {
                format!("cd {}\n{}\n", quote(app_dir), command)
            }
            Action::WriteEnvironment { path, contents } => {
                let file = host_path(path);
                let keys = contents.lines().count();
                let mut s = String::new();
                s.push_str("umask 077\n");
                s.push_str(&format!("mkdir -p \"$(dirname {})\"\n", file));
                s.push_str(&format!("cat > {} <<'{}'\n", file, ENV_HEREDOC));
                s.push_str(contents);
                if !contents.is_empty() && !contents.ends_with('\n') {
                    s.push('\n');
                }
                s.push_str(ENV_HEREDOC);
                s.push('\n');
                s.push_str(&format!("chmod 600 {}\n", file));
                s.push_str(&format!("echo \"wrote {} keys\"\n", keys));
                s
            }
            Action::Migrate {
                app_dir,
                env_file,
                command,
            }
            | Action::CollectStatic {
                app_dir,
                env_file,
                command,
            }
            | Action::ManagementCommand {
                app_dir,
                env_file,
                command,
            } => {
                let mut s = with_env(app_dir, env_file);
                s.push_str(command);
                s.push('\n');
                s
            }
            Action::StartProcess {
                app_dir,
                env_file,
                command,
                pid_file,
                app_log,
            } => {
                let pid = host_path(pid_file);
                let log = host_path(app_log);
                let mut s = with_env(app_dir, env_file);
                s.push_str(&format!("mkdir -p \"$(dirname {})\" \"$(dirname {})\"\n", pid, log));
                s.push_str(&format!(
                    "nohup sh -c {} >> {} 2>&1 < /dev/null &\n",
                    quote(&format!("exec {}", command)),
                    log
                ));
                s.push_str("pid=$!\n");
                s.push_str(&format!("echo \"$pid\" > {}\n", pid));
                s.push_str("sleep 1\n");
                s.push_str("if ! kill -0 \"$pid\" 2>/dev/null; then\n");
                s.push_str(&format!(
                    "  echo \"process exited immediately, see {}\" >&2\n",
                    app_log.replace('"', "")
                ));
                s.push_str("  exit 1\n");
                s.push_str("fi\n");
                s.push_str("echo \"pid=$pid\"\n");
                s
            }
        }
    }
}

/// Expand a phase into its actions. Verification has none: it is a probe.
pub fn phase_actions(
    pipeline: &Pipeline,
    phase: Phase,
    trigger: &Trigger,
    env: &EnvironmentSnapshot,
) -> Vec<Action> {
    let app_dir = pipeline.app.app_dir.trim_end_matches('/').to_string();
    let env_file = pipeline.env_file();

    match phase {
        Phase::TestGate => vec![Action::RunTests {
            workdir: pipeline.commands.test_workdir.clone(),
            command: pipeline.commands.test.clone(),
        }],
        Phase::RemoteSync => vec![
            Action::StopProcess {
                pid_file: pipeline.app.pid_file.clone(),
                port: pipeline.app.port,
                process_pattern: pipeline.app.process_pattern.clone(),
                grace_seconds: pipeline.app.stop_grace_seconds,
            },
            Action::Checkout {
                repo_url: pipeline.app.repo_url.clone(),
                branch: trigger.branch.clone(),
                commit: trigger.commit.clone(),
                app_dir: app_dir.clone(),
            },
            Action::InstallDependencies {
                app_dir,
                command: pipeline.commands.install.clone(),
            },
        ],
        Phase::EnvironmentMaterialization => vec![Action::WriteEnvironment {
            path: env_file,
            contents: env.render(),
        }],
        Phase::MigrationAndAssets => {
            let mut actions = vec![Action::Migrate {
                app_dir: app_dir.clone(),
                env_file: env_file.clone(),
                command: pipeline.commands.migrate.clone(),
            }];
            if !pipeline.commands.collect_static.trim().is_empty() {
                actions.push(Action::CollectStatic {
                    app_dir: app_dir.clone(),
                    env_file: env_file.clone(),
                    command: pipeline.commands.collect_static.clone(),
                });
            }
            for command in &pipeline.commands.post_migrate {
                actions.push(Action::ManagementCommand {
                    app_dir: app_dir.clone(),
                    env_file: env_file.clone(),
                    command: command.clone(),
                });
            }
            actions
        }
        Phase::ProcessRestart => vec![Action::StartProcess {
            app_dir,
            env_file,
            command: pipeline.start_command(),
            pid_file: pipeline.app.pid_file.clone(),
            app_log: pipeline.app.app_log.clone(),
        }],
        Phase::Verification => Vec::new(),
    }
}

/// Quote a host path; relative and `~/` paths resolve under `$HOME`
pub fn host_path(path: &str) -> String {
    if path.starts_with('/') {
        quote(path).into_owned()
    } else {
        let rest = path.strip_prefix("~/").unwrap_or(path);
        format!("\"$HOME\"/{}", quote(rest))
    }
}

fn with_env(app_dir: &str, env_file: &str) -> String {
    let mut s = String::new();
    s.push_str(&format!("cd {}\n", quote(app_dir)));
    s.push_str("set -a\n");
    s.push_str(&format!(". {}\n", host_path(env_file)));
    s.push_str("set +a\n");
    s
}

fn stop_script(pid_file: &str, port: u16, pattern: Option<&str>, grace: u64) -> String {
    let pid = host_path(pid_file);
    let mut s = String::new();
    s.push_str(&format!("pid_file={}\n", pid));
    s.push_str("if [ -f \"$pid_file\" ]; then\n");
    s.push_str("  old_pid=$(cat \"$pid_file\")\n");
    s.push_str("  if [ -n \"$old_pid\" ] && kill -0 \"$old_pid\" 2>/dev/null; then\n");
    s.push_str("    kill \"$old_pid\" || true\n");
    s.push_str("    echo \"stopped pid $old_pid\"\n");
    s.push_str("  fi\n");
    s.push_str("  rm -f \"$pid_file\"\n");
    s.push_str("fi\n");
    if let Some(pattern) = pattern {
        s.push_str(&format!("pkill -f {} || true\n", quote(pattern)));
    }
    s.push_str("if command -v ss >/dev/null 2>&1; then\n");
    s.push_str(&format!(
        "  port_busy() {{ ss -ltn 2>/dev/null | awk '{{print $4}}' | grep -Eq '[:.]{}$'; }}\n",
        port
    ));
    s.push_str("elif command -v fuser >/dev/null 2>&1; then\n");
    s.push_str(&format!(
        "  port_busy() {{ fuser -n tcp {} >/dev/null 2>&1; }}\n",
        port
    ));
    s.push_str("elif command -v lsof >/dev/null 2>&1; then\n");
    s.push_str(&format!(
        "  port_busy() {{ lsof -iTCP:{} -sTCP:LISTEN >/dev/null 2>&1; }}\n",
        port
    ));
    s.push_str("else\n");
    s.push_str("  echo \"no port checker (ss, fuser or lsof) available\" >&2\n");
    s.push_str("  exit 1\n");
    s.push_str("fi\n");
    s.push_str("waited=0\n");
    s.push_str(&format!(
        "while port_busy && [ \"$waited\" -lt {} ]; do sleep 1; waited=$((waited + 1)); done\n",
        grace
    ));
    s.push_str("if port_busy && command -v fuser >/dev/null 2>&1; then\n");
    s.push_str(&format!("  fuser -k -KILL -n tcp {} || true\n", port));
    s.push_str("  sleep 1\n");
    s.push_str("fi\n");
    s.push_str("if port_busy; then\n");
    s.push_str(&format!("  echo \"port {} is still in use\" >&2\n", port));
    s.push_str("  exit 1\n");
    s.push_str("fi\n");
    s.push_str(&format!("echo \"port {} is free\"\n", port));
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> Pipeline {
        Pipeline::from_yaml(
            r#"
name: egsa
target:
  host: 10.0.0.5
app:
  repo_url: https://github.com/example/egsa.git
  app_dir: /srv/egsa/
  process_pattern: gunicorn
commands:
  collect_static: ""
  post_migrate:
    - python3 setup_data.py
    - python3 fix_admin.py
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_host_path() {
        assert_eq!(host_path("/var/log/app.log"), "/var/log/app.log");
        assert_eq!(host_path("app.log"), "\"$HOME\"/app.log");
        assert_eq!(host_path("~/logs/app.log"), "\"$HOME\"/logs/app.log");
        assert_eq!(host_path("my logs/a"), "\"$HOME\"/'my logs/a'");
    }

    #[test]
    fn test_remote_sync_stops_before_clone() {
        let p = pipeline();
        let trigger = Trigger::new("abc123", "main");
        let actions = phase_actions(&p, Phase::RemoteSync, &trigger, &EnvironmentSnapshot::new());

        let labels: Vec<&str> = actions.iter().map(|a| a.label()).collect();
        assert_eq!(labels, vec!["stop-process", "checkout", "install-dependencies"]);
        assert_eq!(actions[2].failure_kind(), FailureKind::DependencyInstall);

        let checkout = actions[1].script();
        assert!(checkout.starts_with("rm -rf /srv/egsa\n"));
        assert!(checkout.contains("checkout --quiet --detach abc123"));
    }

    #[test]
    fn test_migration_phase_skips_empty_collect_static() {
        let p = pipeline();
        let actions = phase_actions(
            &p,
            Phase::MigrationAndAssets,
            &Trigger::new("abc123", "main"),
            &EnvironmentSnapshot::new(),
        );

        let labels: Vec<&str> = actions.iter().map(|a| a.label()).collect();
        assert_eq!(
            labels,
            vec!["migrate", "management-command", "management-command"]
        );
        assert!(actions
            .iter()
            .all(|a| a.failure_kind() == FailureKind::Migration));
        assert!(actions[0].script().contains(". /srv/egsa/.env\n"));
    }

    #[test]
    fn test_environment_heredoc() {
        let mut env = EnvironmentSnapshot::new();
        env.insert("SECRET_KEY", "a'b$c");
        let action = Action::WriteEnvironment {
            path: "/srv/egsa/.env".to_string(),
            contents: env.render(),
        };
        let script = action.script();

        assert!(script.contains("cat > /srv/egsa/.env <<'EGSA_ENV_EOF'\n"));
        assert!(script.contains("SECRET_KEY='a'\\''b$c'\nEGSA_ENV_EOF\n"));
        assert!(script.contains("chmod 600 /srv/egsa/.env"));
    }

    #[test]
    fn test_start_script_reports_pid() {
        let p = pipeline();
        let actions = phase_actions(
            &p,
            Phase::ProcessRestart,
            &Trigger::new("abc123", "main"),
            &EnvironmentSnapshot::new(),
        );
        let script = actions[0].script();

        assert!(script.contains("nohup sh -c 'exec gunicorn --bind 0.0.0.0:8000"));
        assert!(script.contains(">> \"$HOME\"/app.log 2>&1 < /dev/null &"));
        assert!(script.ends_with("echo \"pid=$pid\"\n"));
    }

    #[test]
    fn test_stop_script_frees_port() {
        let script = Action::StopProcess {
            pid_file: "egsa.pid".to_string(),
            port: 8000,
            process_pattern: Some("gunicorn".to_string()),
            grace_seconds: 5,
        }
        .script();

        assert!(script.contains("pkill -f gunicorn || true"));
        assert!(script.contains("awk '{print $4}'"));
        assert!(script.contains("grep -Eq '[:.]8000$'"));
        assert!(script.contains("fuser -k -KILL -n tcp 8000"));
        assert!(script.contains("lsof -iTCP:8000 -sTCP:LISTEN"));
    }

    #[test]
    fn test_stop_without_port_checker_fails() {
        let action = Action::StopProcess {
            pid_file: "egsa.pid".to_string(),
            port: 8000,
            process_pattern: None,
            grace_seconds: 0,
        };
        assert_eq!(action.failure_kind(), FailureKind::ProcessStop);

        // Empty PATH: none of ss, fuser or lsof can be found
        let temp = tempfile::TempDir::new().unwrap();
        let output = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(action.script())
            .env_clear()
            .env("PATH", temp.path())
            .env("HOME", temp.path())
            .output()
            .unwrap();

        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("no port checker"));
        assert!(!String::from_utf8_lossy(&output.stdout).contains("is free"));
    }

    #[test]
    fn test_test_script_stops_on_first_error() {
        let script = Action::RunTests {
            workdir: "/work/egsa".to_string(),
            command: "python3 manage.py test".to_string(),
        }
        .script();

        assert!(script.starts_with("set -e\ncd /work/egsa\n"));
    }

    #[test]
    fn test_verification_has_no_actions() {
        let p = pipeline();
        assert!(phase_actions(
            &p,
            Phase::Verification,
            &Trigger::new("abc", "main"),
            &EnvironmentSnapshot::new()
        )
        .is_empty());
    }
}
