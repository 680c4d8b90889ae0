use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::io;
use std::process::{Output, Stdio};
use std::time::Duration;
use stratlab_core::{BacktestRunner, DateRange, EvaluationRequest, RunnerConfig, VariantMetrics};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Lines of stderr kept in failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// Runs an external backtest program once per call.
///
/// `evaluate` starts `program args...` with the [`EvaluationRequest`] as JSON
/// on stdin and expects a [`VariantMetrics`] JSON object on stdout.
/// `data_span` starts `program args... data-span <instrument_id> <bar>` and
/// expects a `{"start": .., "end": ..}` object.
///
/// If stdout carries log lines besides the result, the last non-empty line
/// is taken as the result.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    config: RunnerConfig,
}

impl SubprocessRunner {
    #[must_use]
    pub const fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn run(&self, mut cmd: Command, input: Option<Vec<u8>>) -> Result<Output> {
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", self.config.program))?;

        let stdin = child.stdin.take();
        let feed = async move {
            let (Some(mut stdin), Some(input)) = (stdin, input) else {
                return Ok::<(), io::Error>(());
            };
            // stdin is dropped on return, which signals EOF
            match stdin.write_all(&input).await {
                // the runner may exit without reading its input
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                written => written,
            }
        };
        // stdin is fed while stdout is drained, all under the timeout
        let exchange = async move {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed.context("failed to write request to runner stdin")?;
            output.context("failed to wait for runner")
        };

        let output = if self.config.timeout_secs == 0 {
            exchange.await?
        } else {
            let limit = Duration::from_secs(self.config.timeout_secs);
            tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| anyhow!("runner timed out after {}s", self.config.timeout_secs))??
        };

        if !output.status.success() {
            bail!(
                "runner exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            );
        }
        Ok(output)
    }
}

#[async_trait]
impl BacktestRunner for SubprocessRunner {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<VariantMetrics> {
        let input = serde_json::to_vec(request)?;
        debug!(job_id = %request.job_id, params = %request.params, "Starting runner");

        let output = self.run(self.command(), Some(input)).await?;
        parse_stdout(&output.stdout)
    }

    async fn data_span(&self, instrument_id: i64, bar: &str) -> Result<DateRange> {
        let mut cmd = self.command();
        cmd.arg("data-span").arg(instrument_id.to_string()).arg(bar);

        let output = self.run(cmd, None).await?;
        let span: DateRange = parse_stdout(&output.stdout)?;
        if span.is_empty() {
            bail!("runner reported empty data span {span} for instrument {instrument_id} {bar}");
        }
        Ok(span)
    }
}

fn parse_stdout<T: DeserializeOwned>(stdout: &[u8]) -> Result<T> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        bail!("runner produced no output");
    }
    if let Ok(value) = serde_json::from_str(text) {
        return Ok(value);
    }
    let last = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or(text);
    serde_json::from_str(last).with_context(|| format!("unparsable runner output: {last}"))
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use stratlab_core::{ParamValue, SlippageConfig, Variant};
    use uuid::Uuid;

    fn shell(script: &str, timeout_secs: u64) -> SubprocessRunner {
        SubprocessRunner::new(RunnerConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout_secs,
            working_dir: None,
        })
    }

    fn request() -> EvaluationRequest {
        EvaluationRequest {
            job_id: Uuid::new_v4(),
            strategy_id: 1,
            instrument_id: 2,
            bar: "1d".to_string(),
            date_range: None,
            params: Variant::new(vec![("fast".to_string(), ParamValue::Int(5))]),
            cash: dec!(10000),
            commission: dec!(0.001),
            slippage: SlippageConfig::default(),
        }
    }

    #[tokio::test]
    async fn metrics_are_read_from_stdout() {
        let runner = shell(
            r#"cat > /dev/null; echo '{"final_value": 10500.5, "sharpe": 1.1, "total_trades": 12}'"#,
            0,
        );
        let metrics = runner.evaluate(&request()).await.unwrap();
        assert_eq!(metrics.final_value, Some(10500.5));
        assert_eq!(metrics.total_trades, Some(12));
        assert_eq!(metrics.maxdd, None);
    }

    #[tokio::test]
    async fn request_is_written_to_stdin() {
        // echoes the requested fast value back as final_value
        let runner = shell(
            r#"grep -q '"fast":5' && echo '{"final_value": 5.0}' || echo '{"final_value": 0.0}'"#,
            0,
        );
        let metrics = runner.evaluate(&request()).await.unwrap();
        assert_eq!(metrics.final_value, Some(5.0));
    }

    #[tokio::test]
    async fn log_lines_before_result_are_skipped() {
        let runner = shell(
            r#"cat > /dev/null; echo "loading bars"; echo '{"final_value": 9000.0}'"#,
            0,
        );
        let metrics = runner.evaluate(&request()).await.unwrap();
        assert_eq!(metrics.final_value, Some(9000.0));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error_with_stderr() {
        let runner = shell("cat > /dev/null; echo 'no bars for instrument' >&2; exit 3", 0);
        let err = runner.evaluate(&request()).await.unwrap_err().to_string();
        assert!(err.contains("no bars for instrument"), "{err}");
    }

    #[tokio::test]
    async fn garbage_output_is_an_error() {
        let runner = shell("cat > /dev/null; echo 'not json'", 0);
        assert!(runner.evaluate(&request()).await.is_err());

        let silent = shell("cat > /dev/null", 0);
        assert!(silent.evaluate(&request()).await.is_err());
    }

    #[tokio::test]
    async fn slow_runner_times_out() {
        let runner = shell("sleep 5", 1);
        let err = runner.evaluate(&request()).await.unwrap_err().to_string();
        assert!(err.contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn runner_ignoring_large_input_still_times_out() {
        // larger than a pipe buffer, so the write cannot complete on its own
        let mut big = request();
        big.bar = "x".repeat(1 << 20);
        let runner = shell("sleep 5", 1);
        let err = runner.evaluate(&big).await.unwrap_err().to_string();
        assert!(err.contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn runner_that_skips_stdin_can_still_answer() {
        let runner = shell(r#"echo '{"final_value": 1.0}'"#, 5);
        let mut big = request();
        big.bar = "x".repeat(1 << 20);
        let metrics = runner.evaluate(&big).await.unwrap();
        assert_eq!(metrics.final_value, Some(1.0));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let runner = SubprocessRunner::new(RunnerConfig {
            program: "/nonexistent/backtest-runner".to_string(),
            ..RunnerConfig::default()
        });
        assert!(runner.evaluate(&request()).await.is_err());
    }

    #[tokio::test]
    async fn data_span_passes_instrument_and_bar() {
        // sh -c binds the trailing args to $0 $1 $2
        let runner = shell(
            r#"[ "$0" = data-span ] && [ "$1" = 7 ] && [ "$2" = 4h ] && echo '{"start": "2022-01-01", "end": "2024-01-01"}'"#,
            0,
        );
        let span = runner.data_span(7, "4h").await.unwrap();
        assert_eq!(span.start, NaiveDate::from_ymd_opt(2022, 1, 1).unwrap());
        assert_eq!(span.end, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[tokio::test]
    async fn empty_data_span_is_an_error() {
        let runner = shell(r#"echo '{"start": "2023-01-01", "end": "2023-01-01"}'"#, 0);
        assert!(runner.data_span(1, "1d").await.is_err());
    }
}
