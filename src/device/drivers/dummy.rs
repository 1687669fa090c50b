//! Hardware-free test instrument.
//!
//! Holds three parameters and a handful of operations for exercising the
//! device stack end to end: string/number transforms, deliberate delays with
//! and without cancellation support, and injected failures. `fail("panic")`
//! panics inside the handler.

use crate::device::{DeviceClass, Driver, OperationRegistry};
use crate::error::{PqnError, PqnResult};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Dummy instrument settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DummyConfig {
    /// Initial integer parameter.
    pub param_int: i64,
    /// Initial string parameter.
    pub param_str: String,
    /// Initial boolean parameter.
    pub param_bool: bool,
    /// Artificial delay of `toggle_bool`, in milliseconds.
    pub toggle_delay_ms: u64,
    /// Fail `start` with a hardware error, as an unplugged instrument would.
    pub fail_on_start: bool,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            param_int: 0,
            param_str: "hello".to_string(),
            param_bool: true,
            toggle_delay_ms: 0,
            fail_on_start: false,
        }
    }
}

#[derive(Debug)]
struct DummyState {
    params: Mutex<Params>,
    toggle_delay: Duration,
}

#[derive(Debug, Clone)]
struct Params {
    int: i64,
    string: String,
    boolean: bool,
}

/// Dummy instrument driver.
pub struct DummyDriver {
    state: Arc<DummyState>,
    fail_on_start: bool,
    operations: OperationRegistry,
}

#[allow(clippy::panic)]
fn simulated_crash() -> ! {
    panic!("simulated driver crash")
}

fn timestamp_us() -> i64 {
    Utc::now().timestamp_micros()
}

impl DummyDriver {
    /// Build the driver and its operation table.
    pub fn new(config: DummyConfig) -> Self {
        let state = Arc::new(DummyState {
            params: Mutex::new(Params {
                int: config.param_int,
                string: config.param_str,
                boolean: config.param_bool,
            }),
            toggle_delay: Duration::from_millis(config.toggle_delay_ms),
        });

        let mut ops = OperationRegistry::new();
        ops.register("double_int", &state, |s, args| async move {
            // With an argument the call is pure; without, it doubles the stored parameter.
            match args.get_or::<Option<i64>>(0, "value", None)? {
                Some(n) => n
                    .checked_mul(2)
                    .ok_or_else(|| PqnError::InvalidArgument(format!("{} * 2 overflows", n))),
                None => {
                    let mut p = s.params.lock();
                    p.int = p.int.wrapping_mul(2);
                    Ok(p.int)
                }
            }
        })
        .register("lowercase_str", &state, |s, _| async move {
            let mut p = s.params.lock();
            p.string = p.string.to_lowercase();
            Ok(p.string.clone())
        })
        .register("uppercase_str", &state, |s, _| async move {
            let mut p = s.params.lock();
            p.string = p.string.to_uppercase();
            Ok(p.string.clone())
        })
        .register("toggle_bool", &state, |s, _| async move {
            tokio::time::sleep(s.toggle_delay).await;
            let mut p = s.params.lock();
            p.boolean = !p.boolean;
            Ok(p.boolean)
        })
        .register("param_int", &state, |s, _| async move { Ok(s.params.lock().int) })
        .register("set_param_int", &state, |s, args| async move {
            let value: i64 = args.get(0, "value")?;
            s.params.lock().int = value;
            Ok(())
        })
        .register("param_str", &state, |s, _| async move {
            Ok(s.params.lock().string.clone())
        })
        .register("set_param_str", &state, |s, args| async move {
            let value: String = args.get(0, "value")?;
            s.params.lock().string = value;
            Ok(())
        })
        .register("param_bool", &state, |s, _| async move { Ok(s.params.lock().boolean) })
        .register("set_param_bool", &state, |s, args| async move {
            let value: bool = args.get(0, "value")?;
            s.params.lock().boolean = value;
            Ok(())
        })
        .register("sleep_ms", &state, |_, args| async move {
            // Ignores cancellation; returns entry/exit timestamps in microseconds.
            let ms: u64 = args.get(0, "ms")?;
            let entered = timestamp_us();
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(vec![entered, timestamp_us()])
        })
        .register("wait_ms", &state, |_, args| async move {
            let ms: u64 = args.get(0, "ms")?;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(ms),
                _ = args.cancel_token().cancelled() => {
                    Err(PqnError::Cancelled(format!("wait_ms({}) cancelled", ms)))
                }
            }
        })
        .register("echo", &state, |_, args| async move { args.get::<Value>(0, "value") })
        .register("count_args", &state, |_, args| async move {
            Ok(json!({ "args": args.args.len(), "kwargs": args.kwargs.keys().collect::<Vec<_>>() }))
        })
        .register("fail", &state, |_, args| async move {
            let kind: String = args.get_or(0, "kind", "hardware".to_string())?;
            let err = match kind.as_str() {
                "hardware" => PqnError::HardwareIo("simulated hardware fault".to_string()),
                "argument" => PqnError::InvalidArgument("simulated bad argument".to_string()),
                "not_ready" => PqnError::NotReady("simulated not ready".to_string()),
                "panic" => simulated_crash(),
                other => PqnError::InvalidArgument(format!("unknown failure kind '{}'", other)),
            };
            Err::<(), _>(err)
        });

        Self {
            state,
            fail_on_start: config.fail_on_start,
            operations: ops,
        }
    }
}

#[async_trait]
impl Driver for DummyDriver {
    fn class(&self) -> DeviceClass {
        DeviceClass::Testing
    }

    fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    async fn start(&self) -> PqnResult<()> {
        if self.fail_on_start {
            return Err(PqnError::HardwareIo("dummy instrument not connected".to_string()));
        }
        info!("Dummy instrument connected");
        Ok(())
    }

    async fn close(&self) -> PqnResult<()> {
        Ok(())
    }

    fn hardware_status(&self) -> BTreeMap<String, Value> {
        let p = self.state.params.lock().clone();
        BTreeMap::from([
            ("param_int".to_string(), json!(p.int)),
            ("param_str".to_string(), json!(p.string)),
            ("param_bool".to_string(), json!(p.boolean)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CallArgs;

    async fn call(driver: &DummyDriver, op: &str, args: Vec<Value>) -> PqnResult<Value> {
        driver
            .operations()
            .invoke("dummy", op, CallArgs::positional(args))
            .await
    }

    #[tokio::test]
    async fn test_string_and_bool_operations() {
        let driver = DummyDriver::new(DummyConfig::default());
        assert_eq!(call(&driver, "uppercase_str", vec![]).await.unwrap(), json!("HELLO"));
        assert_eq!(call(&driver, "lowercase_str", vec![]).await.unwrap(), json!("hello"));
        assert_eq!(call(&driver, "toggle_bool", vec![]).await.unwrap(), json!(false));
        assert_eq!(driver.hardware_status()["param_bool"], json!(false));
    }

    #[tokio::test]
    async fn test_double_int_modes() {
        let driver = DummyDriver::new(DummyConfig {
            param_int: 3,
            ..Default::default()
        });
        assert_eq!(call(&driver, "double_int", vec![json!(10)]).await.unwrap(), json!(20));
        assert_eq!(call(&driver, "double_int", vec![]).await.unwrap(), json!(6));
        assert_eq!(call(&driver, "param_int", vec![]).await.unwrap(), json!(6));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let driver = DummyDriver::new(DummyConfig::default());
        let token = tokio_util::sync::CancellationToken::new();
        let args = CallArgs::positional(vec![json!(5_000)]).with_cancel(token.clone());

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = driver
            .operations()
            .invoke("dummy", "wait_ms", args)
            .await
            .unwrap_err();
        assert!(matches!(err, PqnError::Cancelled(_)));
        cancel.await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_on_start() {
        let driver = DummyDriver::new(DummyConfig {
            fail_on_start: true,
            ..Default::default()
        });
        assert!(driver.start().await.is_err());
    }
}
