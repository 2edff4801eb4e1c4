//! Node-backed [`ModuleLoader`].
//!
//! Bundled handler text is written into a process-local temporary directory
//! under the handler's own file name. Node compiles it as if it were the
//! original source file: `require` resolves from the handler's directory, so
//! packages left external by the bundler are found in the project's
//! `node_modules`, and stack traces name the source path. Inline source maps
//! are honoured through `--enable-source-maps`.
//!
//! The module is inspected once by a small Node script that reports whether
//! a default export exists and what `config` it exports. Each task then runs
//! in a fresh Node process: the `{payload, task}` input goes in as one line on
//! stdin and the result comes back as one JSON document on stdout. Closing
//! stdin aborts the `AbortSignal` passed to the handler.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use taskhost_core::runtime::{Handler, LoadError, LoadedModule, ModuleLoader, ModuleSource};
use taskhost_types::handler::HandlerConfig;

/// Environment variable naming the Node interpreter.
pub const NODE_ENV: &str = "TASKHOST_NODE";

const DEFAULT_NODE: &str = "node";

/// Flags every Node invocation gets unless an interpreter is built by hand.
const DEFAULT_NODE_ARGS: &[&str] = &["--enable-source-maps"];

/// Upper bound for evaluating a module to read its exports.
const DESCRIBE_TIMEOUT_SECS: u64 = 30;

/// How long an aborted handler may take to settle before it is killed.
const DEFAULT_ABORT_GRACE: Duration = Duration::from_secs(5);

/// Shared by both scripts. `argv[1]` is the written module, `argv[2]` the
/// source path it is compiled as. Console output goes to stderr because
/// stdout carries the reply.
macro_rules! shim_prelude {
    () => {
        r#"
const Module = require('module');
const fs = require('fs');
const path = require('path');
const out = process.stdout.write.bind(process.stdout);
console.log = console.error;
console.info = console.error;
console.debug = console.error;
function loadHandlerModule() {
  const file = process.argv[1];
  const source = process.argv[2];
  const mod = new Module(source, null);
  mod.filename = source;
  mod.paths = Module._nodeModulePaths(path.dirname(source));
  mod._compile(fs.readFileSync(file, 'utf8'), source);
  return mod.exports;
}
function defaultExport(exported) {
  return typeof exported === 'function' ? exported : exported && exported.default;
}
"#
    };
}

const DESCRIBE_SHIM: &str = concat!(
    shim_prelude!(),
    r#"
const exported = loadHandlerModule();
const config = exported && typeof exported === 'object' && exported.config !== undefined ? exported.config : null;
out(JSON.stringify({ hasDefault: typeof defaultExport(exported) === 'function', config }));
"#
);

const INVOKE_SHIM: &str = concat!(
    shim_prelude!(),
    r#"
const controller = new AbortController();
let input = '';
let started = false;
async function run(line) {
  let reply;
  try {
    const { payload, task } = JSON.parse(line);
    const handler = defaultExport(loadHandlerModule());
    const result = await handler(payload, task, controller.signal);
    reply = { ok: true, result: result === undefined ? null : result };
  } catch (err) {
    reply = { ok: false, error: err && err.stack ? String(err.stack) : String(err) };
  }
  out(JSON.stringify(reply) + '\n', () => process.exit(0));
}
process.on('SIGTERM', () => controller.abort());
process.stdin.setEncoding('utf8');
process.stdin.on('data', (chunk) => {
  input += chunk;
  const newline = input.indexOf('\n');
  if (!started && newline !== -1) {
    started = true;
    run(input.slice(0, newline));
  }
});
process.stdin.on('end', () => {
  if (!started) {
    started = true;
    run(input);
  } else {
    controller.abort();
  }
});
"#
);

/// Command used to run Node scripts:
/// `program [args..] -e <script> <module> <source path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Interpreter {
    /// `program` with the default Node flags.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: DEFAULT_NODE_ARGS.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    /// `$TASKHOST_NODE`, or `node` from `PATH`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let program = lookup(NODE_ENV)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_NODE.to_string());
        Self::new(program)
    }

    fn command(&self, script: &str, module: &Path, source_path: &Path) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .arg("-e")
            .arg(script)
            .arg(module)
            .arg(source_path);
        command
    }
}

/// What the describe script reports about a module.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModuleDescription {
    has_default: bool,
    #[serde(default)]
    config: Option<Value>,
}

/// Loads bundled handler text by writing it to disk and evaluating it with Node.
#[derive(Debug)]
pub struct NodeModuleLoader {
    interpreter: Interpreter,
    dir: TempDir,
    abort_grace: Duration,
}

impl NodeModuleLoader {
    pub fn new(interpreter: Interpreter) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("taskhost-worker-").tempdir()?;
        Ok(Self {
            interpreter,
            dir,
            abort_grace: DEFAULT_ABORT_GRACE,
        })
    }

    /// Time an aborted handler gets before its process is killed.
    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Where the module for `source` is written. The extension becomes
    /// `.cjs`; the bundle is CommonJS whatever the original language was.
    fn module_path(&self, source: &ModuleSource) -> PathBuf {
        let stem = source
            .source_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "external_task".to_string());
        self.dir.path().join(format!("{stem}.cjs"))
    }

    async fn describe(&self, module: &Path, source_path: &Path) -> Result<ModuleDescription, LoadError> {
        let evaluate_error = |reason: String| LoadError::Evaluate {
            path: source_path.to_path_buf(),
            reason,
        };

        let output = self
            .interpreter
            .command(DESCRIBE_SHIM, module, source_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(Duration::from_secs(DESCRIBE_TIMEOUT_SECS), output)
            .await
            .map_err(|_| evaluate_error(format!("timed out after {DESCRIBE_TIMEOUT_SECS}s")))?
            .map_err(|e| evaluate_error(format!("{}: {e}", self.interpreter.program.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(evaluate_error(stderr.trim().to_string()));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| evaluate_error(format!("unreadable module description: {e}")))
    }
}

fn parse_config(config: Option<Value>, source_path: &Path) -> Result<Option<HandlerConfig>, LoadError> {
    match config {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| LoadError::InvalidConfig {
                path: source_path.to_path_buf(),
                reason: e.to_string(),
            }),
    }
}

impl ModuleLoader for NodeModuleLoader {
    async fn load(&self, source: &ModuleSource) -> Result<LoadedModule, LoadError> {
        let module = self.module_path(source);
        tokio::fs::write(&module, &source.text).await?;

        let description = self.describe(&module, &source.source_path).await?;
        if !description.has_default {
            return Err(LoadError::MissingDefaultExport {
                path: source.source_path.clone(),
            });
        }
        let config = parse_config(description.config, &source.source_path)?;

        tracing::debug!(
            topic = %source.topic,
            module = %module.display(),
            source = %source.source_path.display(),
            has_config = config.is_some(),
            "handler module loaded"
        );
        Ok(LoadedModule {
            handler: Arc::new(ScriptHandler {
                interpreter: self.interpreter.clone(),
                module,
                source_path: source.source_path.clone(),
                abort_grace: self.abort_grace,
            }),
            config,
        })
    }
}

/// Outcome line written by the invoke script.
#[derive(Debug, Deserialize)]
struct InvokeOutcome {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

fn parse_outcome(stdout: &[u8]) -> anyhow::Result<Value> {
    let outcome: InvokeOutcome =
        serde_json::from_slice(stdout).context("handler produced no readable result")?;
    if outcome.ok {
        Ok(outcome.result)
    } else {
        bail!(
            "handler failed: {}",
            outcome.error.unwrap_or_else(|| "unknown error".to_string())
        )
    }
}

/// Runs a module's default export in a fresh interpreter per task.
#[derive(Debug)]
pub struct ScriptHandler {
    interpreter: Interpreter,
    module: PathBuf,
    source_path: PathBuf,
    abort_grace: Duration,
}

impl ScriptHandler {
    async fn run(&self, payload: Value, task: Value, cancel: CancellationToken) -> anyhow::Result<Value> {
        let mut input = serde_json::to_vec(&serde_json::json!({ "payload": payload, "task": task }))?;
        input.push(b'\n');

        let mut child = self
            .interpreter
            .command(INVOKE_SHIM, &self.module, &self.source_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.interpreter.program.display()))?;

        // stdin stays open while the handler runs; closing it aborts the signal.
        let mut stdin = child.stdin.take().context("handler stdin was not captured")?;
        stdin.write_all(&input).await.context("failed to send task to handler")?;
        stdin.flush().await.context("failed to send task to handler")?;

        let mut stdout = child.stdout.take().context("handler stdout was not captured")?;
        let read_reply = async move {
            let mut reply = Vec::new();
            stdout.read_to_end(&mut reply).await.map(|_| reply)
        };
        tokio::pin!(read_reply);

        let finished = tokio::select! {
            reply = &mut read_reply => Some(reply),
            _ = cancel.cancelled() => None,
        };

        let Some(reply) = finished else {
            drop(stdin);
            match tokio::time::timeout(self.abort_grace, &mut read_reply).await {
                Ok(_) => tracing::debug!(source = %self.source_path.display(), "handler settled after abort"),
                Err(_) => {
                    tracing::warn!(
                        source = %self.source_path.display(),
                        grace_ms = self.abort_grace.as_millis() as u64,
                        "handler ignored abort, killing it"
                    );
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill handler process");
                    }
                }
            }
            bail!("handler cancelled");
        };
        let reply = reply.context("failed to read handler reply")?;

        let status = child.wait().await.context("failed to wait for handler")?;
        if !status.success() && reply.is_empty() {
            bail!("handler process exited with {status}");
        }
        parse_outcome(&reply)
    }
}

impl Handler for ScriptHandler {
    fn invoke(&self, payload: Value, task: Value, cancel: CancellationToken) -> BoxFuture<'_, anyhow::Result<Value>> {
        Box::pin(self.run(payload, task, cancel))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Interpreter that runs `script` with `sh`, ignoring the Node arguments.
    fn fake_node(dir: &Path, script: &str) -> Interpreter {
        let path = dir.join("fake-node.sh");
        std::fs::write(&path, script).unwrap();
        Interpreter {
            program: PathBuf::from("sh"),
            args: vec![path.display().to_string()],
        }
    }

    fn source(path: &str) -> ModuleSource {
        ModuleSource {
            topic: "billing".to_string(),
            source_path: PathBuf::from(path),
            text: "module.exports = { default: async () => 1 };".to_string(),
        }
    }

    fn script_handler(interpreter: Interpreter, dir: &Path, abort_grace: Duration) -> ScriptHandler {
        ScriptHandler {
            interpreter,
            module: dir.join("external_task.cjs"),
            source_path: PathBuf::from("/app/billing/external_task.js"),
            abort_grace,
        }
    }

    fn cancel_after(delay: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
        cancel
    }

    /// Tests that need a real interpreter return early when `node` is missing.
    fn node_available() -> bool {
        std::process::Command::new(DEFAULT_NODE)
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Loads `text` as if it lived at `<project>/app/billing/external_task.js`.
    async fn load_node_handler(project: &Path, text: &str) -> (NodeModuleLoader, LoadedModule, PathBuf) {
        let source_path = project.join("app/billing/external_task.js");
        let loader = NodeModuleLoader::new(Interpreter::new(DEFAULT_NODE))
            .unwrap()
            .with_abort_grace(Duration::from_secs(10));
        let module = loader
            .load(&ModuleSource {
                topic: "billing".to_string(),
                source_path: source_path.clone(),
                text: text.to_string(),
            })
            .await
            .unwrap();
        (loader, module, source_path)
    }

    #[test]
    fn interpreter_from_env_defaults_to_node() {
        let default = Interpreter::from_lookup(|_| None);
        assert_eq!(default.program, PathBuf::from("node"));
        assert_eq!(default.args, vec!["--enable-source-maps".to_string()]);
        assert_eq!(
            Interpreter::from_lookup(|_| Some("/opt/node/bin/node".to_string())).program,
            PathBuf::from("/opt/node/bin/node")
        );
        assert_eq!(Interpreter::from_lookup(|_| Some("  ".to_string())).program, PathBuf::from("node"));
    }

    #[test]
    fn command_passes_module_and_source_path_after_script() {
        let interpreter = Interpreter::new("node");
        let command = interpreter.command("0", Path::new("/tmp/x/external_task.cjs"), Path::new("/app/billing/external_task.ts"));
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            ["--enable-source-maps", "-e", "0", "/tmp/x/external_task.cjs", "/app/billing/external_task.ts"]
        );
    }

    #[test]
    fn module_path_keeps_source_file_name() {
        let loader = NodeModuleLoader::new(Interpreter::new("node")).unwrap();
        let path = loader.module_path(&source("/app/billing/external_task.ts"));
        assert_eq!(path, loader.dir().join("external_task.cjs"));
    }

    #[test]
    fn parse_outcome_success_and_failure() {
        assert_eq!(
            parse_outcome(br#"{"ok":true,"result":{"paid":true}}"#).unwrap(),
            serde_json::json!({"paid": true})
        );
        let err = parse_outcome(br#"{"ok":false,"error":"Error: boom"}"#).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(parse_outcome(b"").is_err());
    }

    #[test]
    fn parse_config_null_and_invalid() {
        let path = Path::new("/app/billing/external_task.ts");
        assert!(parse_config(None, path).unwrap().is_none());
        assert!(parse_config(Some(Value::Null), path).unwrap().is_none());

        let config = parse_config(Some(serde_json::json!({"maxTasks": 3})), path).unwrap().unwrap();
        assert_eq!(config.max_tasks, Some(3));

        let err = parse_config(Some(serde_json::json!({"maxTasks": "many"})), path).unwrap_err();
        assert!(matches!(err, LoadError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn load_writes_module_and_reads_config() {
        let scripts = tempfile::tempdir().unwrap();
        let interpreter = fake_node(
            scripts.path(),
            r#"echo '{"hasDefault":true,"config":{"lockDuration":30000}}'"#,
        );
        let loader = NodeModuleLoader::new(interpreter).unwrap();

        let module = loader.load(&source("/app/billing/external_task.ts")).await.unwrap();
        assert_eq!(module.config.unwrap().lock_duration, Some(30_000));

        let written = std::fs::read_to_string(loader.dir().join("external_task.cjs")).unwrap();
        assert!(written.contains("module.exports"));
    }

    #[tokio::test]
    async fn load_without_default_export_fails() {
        let scripts = tempfile::tempdir().unwrap();
        let interpreter = fake_node(scripts.path(), r#"echo '{"hasDefault":false,"config":null}'"#);
        let loader = NodeModuleLoader::new(interpreter).unwrap();

        let err = loader.load(&source("/app/billing/external_task.js")).await.err().unwrap();
        assert!(matches!(err, LoadError::MissingDefaultExport { .. }));
    }

    #[tokio::test]
    async fn load_evaluation_error_carries_stderr() {
        let scripts = tempfile::tempdir().unwrap();
        let interpreter = fake_node(scripts.path(), "echo 'SyntaxError: Unexpected token' >&2; exit 1");
        let loader = NodeModuleLoader::new(interpreter).unwrap();

        match loader.load(&source("/app/billing/external_task.js")).await {
            Err(LoadError::Evaluate { reason, .. }) => assert!(reason.contains("SyntaxError")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("load should fail"),
        }
    }

    #[tokio::test]
    async fn handler_passes_input_and_returns_result() {
        let scripts = tempfile::tempdir().unwrap();
        // Input is a single line; stdin stays open while the handler runs.
        let interpreter = fake_node(
            scripts.path(),
            r#"read -r input; case "$input" in *'"id":"t-1"'*) echo '{"ok":true,"result":"t-1"}';; *) echo '{"ok":false,"error":"no input"}';; esac"#,
        );
        let handler = script_handler(interpreter, scripts.path(), DEFAULT_ABORT_GRACE);

        let result = handler
            .invoke(serde_json::json!({}), serde_json::json!({"id": "t-1"}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("t-1"));
    }

    #[tokio::test]
    async fn handler_cancellation_lets_the_handler_settle() {
        let scripts = tempfile::tempdir().unwrap();
        let marker = scripts.path().join("settled");
        // Waits for stdin to close, then cleans up and replies.
        let interpreter = fake_node(
            scripts.path(),
            &format!(
                r#"read -r line; cat > /dev/null; touch '{}'; echo '{{"ok":true,"result":null}}'"#,
                marker.display()
            ),
        );
        let handler = script_handler(interpreter, scripts.path(), Duration::from_secs(10));

        let err = handler
            .invoke(Value::Null, Value::Null, cancel_after(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert!(marker.exists(), "handler should observe the abort before returning");
    }

    #[tokio::test]
    async fn handler_ignoring_abort_is_killed_after_grace() {
        let scripts = tempfile::tempdir().unwrap();
        let interpreter = fake_node(scripts.path(), "read -r line; cat > /dev/null; exec sleep 30");
        let handler = script_handler(interpreter, scripts.path(), Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = handler
            .invoke(Value::Null, Value::Null, cancel_after(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn node_handler_resolves_packages_next_to_its_source() {
        if !node_available() {
            eprintln!("node not found, skipping");
            return;
        }
        let project = tempfile::tempdir().unwrap();
        let package = project.path().join("node_modules/@opentelemetry/api");
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(package.join("index.js"), "module.exports = { trace: 'stub' };").unwrap();

        let (_loader, module, _) = load_node_handler(
            project.path(),
            "const api = require('@opentelemetry/api');\n\
             module.exports = { default: async () => api.trace };",
        )
        .await;

        let result = module
            .handler
            .invoke(Value::Null, serde_json::json!({"id": "t-1"}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("stub"));
    }

    #[tokio::test]
    async fn node_handler_receives_abort_signal() {
        if !node_available() {
            eprintln!("node not found, skipping");
            return;
        }
        let project = tempfile::tempdir().unwrap();
        let marker = project.path().join("aborted");
        let (_loader, module, _) = load_node_handler(
            project.path(),
            "const fs = require('fs');\n\
             module.exports = { default: async (payload, task, signal) => {\n\
               if (task.wait !== true) return { aborted: signal.aborted };\n\
               await new Promise((resolve) => signal.addEventListener('abort', resolve));\n\
               fs.writeFileSync(task.marker, String(signal.aborted));\n\
               return null;\n\
             } };",
        )
        .await;

        let result = module
            .handler
            .invoke(Value::Null, serde_json::json!({"wait": false}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"aborted": false}));

        let task = serde_json::json!({"wait": true, "marker": marker.display().to_string()});
        let err = module
            .handler
            .invoke(Value::Null, task, cancel_after(Duration::from_millis(500)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "true");
    }

    #[tokio::test]
    async fn node_handler_errors_name_the_source_file() {
        if !node_available() {
            eprintln!("node not found, skipping");
            return;
        }
        let project = tempfile::tempdir().unwrap();
        let (_loader, module, source_path) = load_node_handler(
            project.path(),
            "module.exports = { default: async () => { throw new Error('boom'); } };",
        )
        .await;

        let err = module
            .handler
            .invoke(Value::Null, Value::Null, CancellationToken::new())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("boom"));
        assert!(
            message.contains(&source_path.display().to_string()),
            "stack should point at the handler source: {message}"
        );
    }
}
