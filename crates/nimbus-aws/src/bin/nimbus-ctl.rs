// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nimbus Control CLI
//!
//! Deploys functions to Lambda and invokes them through the result queue.
//!
//! Usage:
//!   nimbus-ctl <command> [options]
//!
//! Commands:
//!   deploy-archive --file <path> [--handler <h>] [--name <n>]
//!   deploy-module --module <path> [--handler <h>] [--deps <a,b>] [--name <n>]
//!   run-inline --code <js> [--deps <a,b>] [--args <json>]
//!   invoke --function <name> [--args <json>] [--timeout-ms <ms>]
//!   bind-queue

use std::fs;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use nimbus_aws::{LambdaCompute, SqsResultQueue};
use nimbus_core::packager::RunConfig;
use nimbus_core::{ArchiveSource, CloudFunctionProxy, InlineSource, ModuleSource, Nimbus, Settings};
use nimbus_core::{ResultQueue, result_channel::QueueBinding};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = r#"Usage: nimbus-ctl <command> [options]

Deploy and invoke remote functions.

COMMANDS:
    deploy-archive                  Deploy a prebuilt zip archive
    deploy-module                   Deploy a local module file
    run-inline                      Deploy an inline function and call it once
    invoke                          Call an already deployed function
    bind-queue                      Look up or create the result queue

DEPLOY OPTIONS:
    --file <path>                   Zip archive (deploy-archive, required)
    --module <path>                 Module path (deploy-module, required)
    --handler <name>                Handler or exported function name
    --deps <a,b,...>                Comma-separated dependencies
    --name <name>                   Explicit function name
    --runtime <id>                  Lambda runtime (default: nodejs20.x)
    --memory <mb>                   Memory size in MB (default: 128)
    --timeout <seconds>             Function timeout (default: 3)

INVOKE OPTIONS:
    --function <name>               Function name (invoke, required)
    --code <js>                     Function source (run-inline, required)
    --args <json>                   Positional arguments as a JSON array (default: [])
    --timeout-ms <ms>               Invocation timeout

ENVIRONMENT:
    NIMBUS_REGION                   AWS region (default: us-west-2)
    NIMBUS_QUEUE_NAME               Result queue name (default: LambdaResultsQueue)
    NIMBUS_UPLOAD_TIMEOUT_MS        Deploy timeout (default: 5000)
    NIMBUS_LAMBDA_ROLE_ARN          Execution role for created functions
    NIMBUS_ENDPOINT_URL             Endpoint override (e.g. LocalStack)
    RUST_LOG                        Log filter (default: nimbus_core=info,nimbus_aws=info)

EXAMPLES:
    nimbus-ctl deploy-module --module ./lib/math.js --handler add
    nimbus-ctl invoke --function nimbus-fromModule-math-0123456789ab --args '[1, 2]'
    nimbus-ctl run-inline --code '(a, b) => a + b' --args '[1, 2]'
"#;

fn print_usage() {
    eprintln!("{}", USAGE);
}

/// Options shared by the deploy commands.
#[derive(Debug, Default, Clone, PartialEq)]
struct DeployOptions {
    handler: Option<String>,
    deps: Vec<String>,
    name: Option<String>,
    runtime: Option<String>,
    memory_mb: Option<u32>,
    timeout_secs: Option<u32>,
}

impl DeployOptions {
    fn run_config(&self) -> RunConfig {
        let mut config = RunConfig::default();
        if let Some(name) = &self.name {
            config = config.with_name(name);
        }
        if let Some(runtime) = &self.runtime {
            config = config.with_runtime(runtime);
        }
        if let Some(memory) = self.memory_mb {
            config = config.with_memory_mb(memory);
        }
        if let Some(timeout) = self.timeout_secs {
            config = config.with_timeout_secs(timeout);
        }
        config
    }
}

#[derive(Debug)]
enum Command {
    DeployArchive {
        file: String,
        options: DeployOptions,
    },
    DeployModule {
        module: String,
        options: DeployOptions,
    },
    RunInline {
        code: String,
        args: Vec<Value>,
        options: DeployOptions,
        timeout_ms: Option<u64>,
    },
    Invoke {
        function: String,
        args: Vec<Value>,
        timeout_ms: Option<u64>,
    },
    BindQueue,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from_vec(&args)
}

fn parse_json_args(raw: &str) -> Result<Vec<Value>, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(values)) => Ok(values),
        Ok(_) => Err("--args must be a JSON array".to_string()),
        Err(e) => Err(format!("Invalid --args JSON: {}", e)),
    }
}

fn parse_deps(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Consume a deploy option at `args[*i]`; returns false if it is not one.
fn parse_deploy_option(
    args: &[String],
    i: &mut usize,
    options: &mut DeployOptions,
) -> Result<bool, String> {
    match args[*i].as_str() {
        "--handler" => {
            *i += 1;
            options.handler = Some(args.get(*i).ok_or("--handler requires a name")?.clone());
        }
        "--deps" => {
            *i += 1;
            options.deps = parse_deps(args.get(*i).ok_or("--deps requires a list")?);
        }
        "--name" => {
            *i += 1;
            options.name = Some(args.get(*i).ok_or("--name requires a value")?.clone());
        }
        "--runtime" => {
            *i += 1;
            options.runtime = Some(args.get(*i).ok_or("--runtime requires a value")?.clone());
        }
        "--memory" => {
            *i += 1;
            options.memory_mb = Some(
                args.get(*i)
                    .ok_or("--memory requires a number")?
                    .parse()
                    .map_err(|_| "Invalid memory size")?,
            );
        }
        "--timeout" => {
            *i += 1;
            options.timeout_secs = Some(
                args.get(*i)
                    .ok_or("--timeout requires a number")?
                    .parse()
                    .map_err(|_| "Invalid timeout")?,
            );
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn parse_timeout_ms(args: &[String], i: usize) -> Result<u64, String> {
    args.get(i)
        .ok_or("--timeout-ms requires a number")?
        .parse()
        .map_err(|_| "Invalid timeout-ms".to_string())
}

fn parse_args_from_vec(args: &[String]) -> Result<Command, String> {
    if args.len() < 2 {
        return Err("No command specified".to_string());
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => {
            print_usage();
            std::process::exit(0);
        }
        "deploy-archive" => {
            let mut file: Option<String> = None;
            let mut options = DeployOptions::default();

            let mut i = 2;
            while i < args.len() {
                if !parse_deploy_option(args, &mut i, &mut options)? {
                    match args[i].as_str() {
                        "--file" => {
                            i += 1;
                            file = Some(args.get(i).ok_or("--file requires a path")?.clone());
                        }
                        arg => return Err(format!("Unknown argument: {}", arg)),
                    }
                }
                i += 1;
            }

            if !options.deps.is_empty() {
                return Err("--deps is not supported for archives".to_string());
            }
            Ok(Command::DeployArchive {
                file: file.ok_or("--file is required")?,
                options,
            })
        }
        "deploy-module" => {
            let mut module: Option<String> = None;
            let mut options = DeployOptions::default();

            let mut i = 2;
            while i < args.len() {
                if !parse_deploy_option(args, &mut i, &mut options)? {
                    match args[i].as_str() {
                        "--module" => {
                            i += 1;
                            module = Some(args.get(i).ok_or("--module requires a path")?.clone());
                        }
                        arg => return Err(format!("Unknown argument: {}", arg)),
                    }
                }
                i += 1;
            }

            Ok(Command::DeployModule {
                module: module.ok_or("--module is required")?,
                options,
            })
        }
        "run-inline" => {
            let mut code: Option<String> = None;
            let mut call_args = Vec::new();
            let mut timeout_ms: Option<u64> = None;
            let mut options = DeployOptions::default();

            let mut i = 2;
            while i < args.len() {
                if !parse_deploy_option(args, &mut i, &mut options)? {
                    match args[i].as_str() {
                        "--code" => {
                            i += 1;
                            code = Some(args.get(i).ok_or("--code requires source")?.clone());
                        }
                        "--args" => {
                            i += 1;
                            call_args = parse_json_args(args.get(i).ok_or("--args requires JSON")?)?;
                        }
                        "--timeout-ms" => {
                            i += 1;
                            timeout_ms = Some(parse_timeout_ms(args, i)?);
                        }
                        arg => return Err(format!("Unknown argument: {}", arg)),
                    }
                }
                i += 1;
            }

            if options.handler.is_some() {
                return Err("--handler is not supported for inline code".to_string());
            }
            Ok(Command::RunInline {
                code: code.ok_or("--code is required")?,
                args: call_args,
                options,
                timeout_ms,
            })
        }
        "invoke" => {
            let mut function: Option<String> = None;
            let mut call_args = Vec::new();
            let mut timeout_ms: Option<u64> = None;

            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--function" => {
                        i += 1;
                        function = Some(args.get(i).ok_or("--function requires a name")?.clone());
                    }
                    "--args" => {
                        i += 1;
                        call_args = parse_json_args(args.get(i).ok_or("--args requires JSON")?)?;
                    }
                    "--timeout-ms" => {
                        i += 1;
                        timeout_ms = Some(parse_timeout_ms(args, i)?);
                    }
                    arg => return Err(format!("Unknown argument: {}", arg)),
                }
                i += 1;
            }

            Ok(Command::Invoke {
                function: function.ok_or("--function is required")?,
                args: call_args,
                timeout_ms,
            })
        }
        "bind-queue" => Ok(Command::BindQueue),
        cmd => Err(format!("Unknown command: {}", cmd)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cmd = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("nimbus_core=info,nimbus_aws=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match execute_command(cmd).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute_command(cmd: Command) -> anyhow::Result<()> {
    let settings = Settings::from_env().context("Invalid configuration")?;

    if let Command::BindQueue = cmd {
        let queue = SqsResultQueue::from_settings(&settings).await;
        let binding: QueueBinding = queue
            .bind(&settings.queue_name)
            .await
            .context("Failed to bind result queue")?;
        println!("{}", binding.address);
        return Ok(());
    }

    let compute = LambdaCompute::from_settings(&settings)
        .await
        .context("Failed to set up Lambda")?;
    let queue = SqsResultQueue::from_settings(&settings).await;
    let nimbus = Nimbus::builder()
        .settings(settings)
        .compute(Arc::new(compute))
        .queue(Arc::new(queue))
        .build()?;

    match cmd {
        Command::DeployArchive { file, options } => {
            let bytes = fs::read(&file).with_context(|| format!("Failed to read archive {}", file))?;
            let mut source = ArchiveSource::new(bytes).with_config(options.run_config());
            if let Some(handler) = options.handler {
                source = source.with_handler(handler);
            }
            let proxy = nimbus.create_archive(source).await?;
            println!("{}", proxy.function_name());
        }

        Command::DeployModule { module, options } => {
            let base_dir = std::env::current_dir().context("Failed to read working directory")?;
            let mut source = ModuleSource::new(module)
                .with_dependencies(options.deps.clone())
                .with_config(options.run_config())
                .relative_to(base_dir);
            if let Some(handler) = options.handler {
                source = source.with_handler(handler);
            }
            let proxy = nimbus.create_module(source).await?;
            println!("{}", proxy.function_name());
        }

        Command::RunInline {
            code,
            args,
            options,
            timeout_ms,
        } => {
            let base_dir = std::env::current_dir().context("Failed to read working directory")?;
            let source = InlineSource::new(code)
                .with_dependencies(options.deps.clone())
                .with_config(options.run_config())
                .relative_to(base_dir);
            let proxy = nimbus.create_inline(source).await?;
            call_and_print(&nimbus, proxy, args, timeout_ms).await?;
        }

        Command::Invoke {
            function,
            args,
            timeout_ms,
        } => {
            let proxy = nimbus.attach(function);
            call_and_print(&nimbus, proxy, args, timeout_ms).await?;
        }

        Command::BindQueue => bail!("bind-queue handled above"),
    }

    Ok(())
}

async fn call_and_print(
    nimbus: &Nimbus,
    proxy: CloudFunctionProxy,
    args: Vec<Value>,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    let proxy = match timeout_ms {
        Some(ms) => proxy.with_timeout(Duration::from_millis(ms)),
        None => proxy,
    };

    let address = nimbus.start().await?;
    info!(function = %proxy.function_name(), queue_address = %address, "Invoking");

    let outcome = proxy.call(args).await;
    nimbus.shutdown().await;

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_no_command() {
        let result = parse_args_from_vec(&args(&["nimbus-ctl"]));
        assert_eq!(result.unwrap_err(), "No command specified");
    }

    #[test]
    fn test_parse_unknown_command() {
        let result = parse_args_from_vec(&args(&["nimbus-ctl", "deploy"]));
        assert!(result.unwrap_err().contains("Unknown command"));
    }

    #[test]
    fn test_parse_deploy_archive_requires_file() {
        let result = parse_args_from_vec(&args(&["nimbus-ctl", "deploy-archive"]));
        assert!(result.unwrap_err().contains("--file is required"));
    }

    #[test]
    fn test_parse_deploy_archive_full() {
        let result = parse_args_from_vec(&args(&[
            "nimbus-ctl",
            "deploy-archive",
            "--file",
            "bundle.zip",
            "--handler",
            "main.run",
            "--memory",
            "512",
            "--timeout",
            "60",
        ]));
        match result.unwrap() {
            Command::DeployArchive { file, options } => {
                assert_eq!(file, "bundle.zip");
                assert_eq!(options.handler.as_deref(), Some("main.run"));
                let config = options.run_config();
                assert_eq!(config.memory_mb, 512);
                assert_eq!(config.timeout_secs, 60);
            }
            other => panic!("Expected DeployArchive, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_deploy_archive_rejects_deps() {
        let result = parse_args_from_vec(&args(&[
            "nimbus-ctl",
            "deploy-archive",
            "--file",
            "bundle.zip",
            "--deps",
            "lodash",
        ]));
        assert!(result.unwrap_err().contains("not supported"));
    }

    #[test]
    fn test_usage_states_run_config_defaults() {
        let config = DeployOptions::default().run_config();
        assert!(USAGE.contains(&format!("(default: {})", config.runtime)));
        assert!(USAGE.contains(&format!("Memory size in MB (default: {})", config.memory_mb)));
        assert!(USAGE.contains(&format!(
            "Function timeout (default: {})",
            config.timeout_secs
        )));
    }

    #[test]
    fn test_parse_deploy_module_with_deps() {
        let result = parse_args_from_vec(&args(&[
            "nimbus-ctl",
            "deploy-module",
            "--module",
            "./lib/math",
            "--handler",
            "add",
            "--deps",
            "./lib/helpers, left-pad,",
        ]));
        match result.unwrap() {
            Command::DeployModule { module, options } => {
                assert_eq!(module, "./lib/math");
                assert_eq!(options.handler.as_deref(), Some("add"));
                assert_eq!(options.deps, vec!["./lib/helpers", "left-pad"]);
            }
            other => panic!("Expected DeployModule, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_invalid_memory() {
        let result = parse_args_from_vec(&args(&[
            "nimbus-ctl",
            "deploy-module",
            "--module",
            "./m",
            "--memory",
            "lots",
        ]));
        assert_eq!(result.unwrap_err(), "Invalid memory size");
    }

    #[test]
    fn test_parse_invoke() {
        let result = parse_args_from_vec(&args(&[
            "nimbus-ctl",
            "invoke",
            "--function",
            "adder",
            "--args",
            "[1, 2]",
            "--timeout-ms",
            "5000",
        ]));
        match result.unwrap() {
            Command::Invoke {
                function,
                args,
                timeout_ms,
            } => {
                assert_eq!(function, "adder");
                assert_eq!(args, vec![json!(1), json!(2)]);
                assert_eq!(timeout_ms, Some(5000));
            }
            other => panic!("Expected Invoke, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_invoke_args_must_be_array() {
        let result = parse_args_from_vec(&args(&[
            "nimbus-ctl",
            "invoke",
            "--function",
            "adder",
            "--args",
            "{\"a\": 1}",
        ]));
        assert_eq!(result.unwrap_err(), "--args must be a JSON array");
    }

    #[test]
    fn test_parse_run_inline() {
        let result = parse_args_from_vec(&args(&[
            "nimbus-ctl",
            "run-inline",
            "--code",
            "(a, b) => a + b",
            "--args",
            "[1, 2]",
        ]));
        match result.unwrap() {
            Command::RunInline { code, args, .. } => {
                assert_eq!(code, "(a, b) => a + b");
                assert_eq!(args.len(), 2);
            }
            other => panic!("Expected RunInline, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_run_inline_rejects_handler() {
        let result = parse_args_from_vec(&args(&[
            "nimbus-ctl",
            "run-inline",
            "--code",
            "() => 1",
            "--handler",
            "x",
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_bind_queue() {
        let result = parse_args_from_vec(&args(&["nimbus-ctl", "bind-queue"]));
        assert!(matches!(result.unwrap(), Command::BindQueue));
    }
}
