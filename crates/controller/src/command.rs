//! Operator commands: parsing of inbound pub/sub messages and the FIFO that
//! hands them from the listener thread to the worker.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Command types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandKind {
    TokenLoad { litres: i64 },
    ValveOpen,
    ValveClose,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenLoad { litres } => write!(f, "token load {litres} L"),
            Self::ValveOpen => write!(f, "valve open"),
            Self::ValveClose => write!(f, "valve close"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Command {
    pub(crate) kind: CommandKind,
    pub(crate) address: u8,
    /// The `deviceID` the operator used; echoed back in the status report.
    pub(crate) external_id: String,
}

/// Outcome tag carried by a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StatusTag {
    LoadSuccess,
    LoadFailure,
    ValveOpen,
    ValveClosed,
}

impl fmt::Display for StatusTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LoadSuccess => "load_success",
            Self::LoadFailure => "load_failure",
            Self::ValveOpen => "valve_open",
            Self::ValveClosed => "valve_closed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Inbound parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InboundMsg {
    message: String,
    #[serde(default)]
    litres: Option<serde_json::Number>,
    #[serde(rename = "deviceID")]
    device_id: String,
}

/// Bus address from a `"<prefix>-<address>"` device id: the decimal suffix
/// after the last `-`.
pub(crate) fn address_from_device_id(device_id: &str) -> Option<u8> {
    let (_, suffix) = device_id.rsplit_once('-')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

fn whole_litres(n: &serde_json::Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    let f = n.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// Turn an inbound payload into a command for one of `addresses`.
pub(crate) fn parse_inbound(payload: &[u8], addresses: &[u8]) -> Result<Command> {
    let msg: InboundMsg = serde_json::from_slice(payload).context("bad command json")?;

    let address = address_from_device_id(&msg.device_id)
        .ok_or_else(|| anyhow!("bad deviceID '{}'", msg.device_id))?;
    if !addresses.contains(&address) {
        bail!("device {address} is not configured on this controller");
    }

    let kind = match msg.message.as_str() {
        "success" => {
            let litres = match &msg.litres {
                None => 0,
                Some(n) => whole_litres(n)
                    .ok_or_else(|| anyhow!("litres must be a whole number, got {n}"))?,
            };
            CommandKind::TokenLoad { litres }
        }
        "valve_open" => CommandKind::ValveOpen,
        "valve_close" => CommandKind::ValveClose,
        other => bail!("unknown command message '{other}'"),
    };

    Ok(Command {
        kind,
        address,
        external_id: msg.device_id,
    })
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// FIFO between the listener (producer) and the worker (consumer). Shared
/// behind an `Arc`.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    items: Mutex<VecDeque<Command>>,
    ready: Condvar,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Command>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, command: Command) {
        self.lock().push_back(command);
        self.ready.notify_all();
    }

    pub(crate) fn pop(&self) -> Option<Command> {
        self.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Block until the queue is non-empty or `timeout` passes. Returns whether
    /// work is waiting.
    pub(crate) fn wait_for_work(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |q| q.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        !guard.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    const FLEET: &[u8] = &[12, 13];

    fn cmd(address: u8, kind: CommandKind) -> Command {
        Command {
            kind,
            address,
            external_id: format!("FQX_SM_10006-{address}"),
        }
    }

    // -- address_from_device_id -----------------------------------------------

    #[test]
    fn address_from_suffix() {
        assert_eq!(address_from_device_id("FQX_SM_10006-13"), Some(13));
        assert_eq!(address_from_device_id("a-b-c-7"), Some(7));
    }

    #[test]
    fn address_rejects_bad_suffix() {
        assert_eq!(address_from_device_id("FQX_SM_10006"), None);
        assert_eq!(address_from_device_id("FQX-"), None);
        assert_eq!(address_from_device_id("FQX-1a"), None);
        assert_eq!(address_from_device_id("FQX-300"), None);
    }

    // -- parse_inbound --------------------------------------------------------

    #[test]
    fn parse_token_load() {
        let c = parse_inbound(
            br#"{"message":"success","litres":200,"deviceID":"FQX_SM_10006-13"}"#,
            FLEET,
        )
        .unwrap();
        assert_eq!(c.kind, CommandKind::TokenLoad { litres: 200 });
        assert_eq!(c.address, 13);
        assert_eq!(c.external_id, "FQX_SM_10006-13");
    }

    #[test]
    fn parse_token_load_null_or_missing_litres_is_zero() {
        for payload in [
            br#"{"message":"success","litres":null,"deviceID":"X-12"}"#.as_slice(),
            br#"{"message":"success","deviceID":"X-12"}"#.as_slice(),
        ] {
            let c = parse_inbound(payload, FLEET).unwrap();
            assert_eq!(c.kind, CommandKind::TokenLoad { litres: 0 });
        }
    }

    #[test]
    fn parse_token_load_whole_float() {
        let c = parse_inbound(br#"{"message":"success","litres":50.0,"deviceID":"X-12"}"#, FLEET)
            .unwrap();
        assert_eq!(c.kind, CommandKind::TokenLoad { litres: 50 });
    }

    #[test]
    fn parse_token_load_fractional_rejected() {
        assert!(
            parse_inbound(br#"{"message":"success","litres":1.5,"deviceID":"X-12"}"#, FLEET)
                .is_err()
        );
    }

    #[test]
    fn parse_negative_litres_kept_for_the_worker() {
        let c = parse_inbound(br#"{"message":"success","litres":-5,"deviceID":"X-12"}"#, FLEET)
            .unwrap();
        assert_eq!(c.kind, CommandKind::TokenLoad { litres: -5 });
    }

    #[test]
    fn parse_valve_commands() {
        let open = parse_inbound(
            br#"{"message":"valve_open","litres":null,"deviceID":"X-12"}"#,
            FLEET,
        )
        .unwrap();
        assert_eq!(open.kind, CommandKind::ValveOpen);
        let close =
            parse_inbound(br#"{"message":"valve_close","deviceID":"X-13"}"#, FLEET).unwrap();
        assert_eq!(close.kind, CommandKind::ValveClose);
    }

    #[test]
    fn parse_rejects_unknown_message() {
        let err = parse_inbound(br#"{"message":"reboot","deviceID":"X-12"}"#, FLEET).unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }

    #[test]
    fn parse_rejects_unconfigured_address() {
        assert!(parse_inbound(br#"{"message":"valve_open","deviceID":"X-99"}"#, FLEET).is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_inbound(b"not json", FLEET).is_err());
        assert!(parse_inbound(br#"{"message":"success"}"#, FLEET).is_err());
    }

    // -- Display --------------------------------------------------------------

    #[test]
    fn status_tag_serializes_as_wire_string() {
        assert_eq!(
            serde_json::to_string(&StatusTag::ValveClosed).unwrap(),
            r#""valve_closed""#
        );
        assert_eq!(StatusTag::LoadFailure.to_string(), "load_failure");
    }

    #[test]
    fn command_kind_display() {
        assert_eq!(CommandKind::TokenLoad { litres: 20 }.to_string(), "token load 20 L");
        assert_eq!(CommandKind::ValveClose.to_string(), "valve close");
    }

    // -- CommandQueue ---------------------------------------------------------

    #[test]
    fn queue_is_fifo() {
        let q = CommandQueue::new();
        q.push(cmd(12, CommandKind::ValveOpen));
        q.push(cmd(13, CommandKind::ValveClose));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().address, 12);
        assert_eq!(q.pop().unwrap().address, 13);
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn cross_thread_order_is_preserved() {
        let q = Arc::new(CommandQueue::new());
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for litres in [1, 2, 3] {
                    q.push(cmd(13, CommandKind::TokenLoad { litres }));
                }
            })
        };
        producer.join().unwrap();

        let order: Vec<i64> = std::iter::from_fn(|| q.pop())
            .map(|c| match c.kind {
                CommandKind::TokenLoad { litres } => litres,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn pushes_during_drain_keep_fifo_order() {
        const TOTAL: i64 = 500;
        let q = Arc::new(CommandQueue::new());
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for litres in 1..=TOTAL {
                    q.push(cmd(13, CommandKind::TokenLoad { litres }));
                    if litres % 50 == 0 {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut order = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while order.len() < TOTAL as usize && Instant::now() < deadline {
            if !q.wait_for_work(Duration::from_millis(50)) {
                continue;
            }
            while let Some(c) = q.pop() {
                match c.kind {
                    CommandKind::TokenLoad { litres } => order.push(litres),
                    _ => unreachable!(),
                }
            }
        }
        producer.join().unwrap();

        assert_eq!(order, (1..=TOTAL).collect::<Vec<_>>());
        assert!(q.is_empty());
    }

    #[test]
    fn wait_for_work_times_out_when_empty() {
        let q = CommandQueue::new();
        assert!(!q.wait_for_work(Duration::from_millis(20)));
    }

    #[test]
    fn wait_for_work_wakes_on_push() {
        let q = Arc::new(CommandQueue::new());
        let started = Instant::now();
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                q.push(cmd(12, CommandKind::ValveOpen));
            })
        };
        assert!(q.wait_for_work(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(10));
        producer.join().unwrap();
    }

    #[test]
    fn wait_for_work_returns_immediately_when_queued() {
        let q = CommandQueue::new();
        q.push(cmd(12, CommandKind::ValveOpen));
        assert!(q.wait_for_work(Duration::from_secs(10)));
    }
}
