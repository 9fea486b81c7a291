//! Command validation and dispatch.
//!
//! A well-formed command is an array of bulk strings whose first element
//! names a verb. The handler checks the shape, runs the operation against
//! the storage engine, and returns the reply value. Shape problems are
//! application errors: the client gets an `-ERR ...` reply and keeps its
//! connection; only the byte layer below ever drops a client.
//!
//! Supported verbs (case-insensitive):
//!
//! - `GET key` — bulk string reply, or nil when absent
//! - `SET key value` — `+OK`
//! - `DEL key [key ...]` — integer count of keys actually removed
//!
//! Multi-key DEL deletes per occurrence, so a repeated key only counts the
//! first time it is seen.

use crate::protocol::RespValue;
use crate::storage::StorageEngine;
use bytes::Bytes;
use std::sync::Arc;

/// Executes parsed command frames against the storage engine.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
}

impl CommandHandler {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self { storage }
    }

    /// Runs one command frame to completion and returns its reply.
    pub fn execute(&self, frame: RespValue) -> RespValue {
        let args = match frame {
            RespValue::Array(args) if !args.is_empty() => args,
            RespValue::Array(_) => return RespValue::error("ERR empty command"),
            _ => return RespValue::error("ERR invalid command format"),
        };

        let verb = match args[0].as_bulk() {
            Some(verb) => verb,
            None => return RespValue::error("ERR invalid command format"),
        };

        if verb.eq_ignore_ascii_case(b"GET") {
            self.get(&args)
        } else if verb.eq_ignore_ascii_case(b"SET") {
            self.set(&args)
        } else if verb.eq_ignore_ascii_case(b"DEL") {
            self.del(&args)
        } else {
            RespValue::error(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(verb)
            ))
        }
    }

    fn get(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("get");
        }
        let Some(key) = args[1].as_bulk() else {
            return wrong_type();
        };
        match self.storage.get(key) {
            Some(value) => value,
            None => RespValue::Null,
        }
    }

    fn set(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 3 {
            return wrong_arity("set");
        }
        let (Some(key), Some(value)) = (args[1].as_bulk(), args[2].as_bulk()) else {
            return wrong_type();
        };
        self.storage
            .set(key.clone(), RespValue::Bulk(value.clone()));
        RespValue::ok()
    }

    fn del(&self, args: &[RespValue]) -> RespValue {
        if args.len() < 2 {
            return wrong_arity("del");
        }
        let mut keys: Vec<&Bytes> = Vec::with_capacity(args.len() - 1);
        for arg in &args[1..] {
            match arg.as_bulk() {
                Some(key) => keys.push(key),
                None => return wrong_type(),
            }
        }
        let removed = keys.into_iter().filter(|key| self.storage.del(key)).count();
        RespValue::Integer(removed as i64)
    }
}

fn wrong_arity(verb: &str) -> RespValue {
    RespValue::error(format!("ERR wrong number of arguments for '{verb}' command"))
}

fn wrong_type() -> RespValue {
    RespValue::error("ERR invalid argument type")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> CommandHandler {
        CommandHandler::new(Arc::new(StorageEngine::new()))
    }

    fn cmd(parts: &[&'static [u8]]) -> RespValue {
        RespValue::Array(
            parts
                .iter()
                .map(|p| RespValue::Bulk(Bytes::from_static(p)))
                .collect(),
        )
    }

    #[test]
    fn set_then_get_round_trips() {
        let h = handler();
        assert_eq!(h.execute(cmd(&[b"SET", b"foo", b"bar"])), RespValue::ok());
        assert_eq!(
            h.execute(cmd(&[b"GET", b"foo"])),
            RespValue::Bulk(Bytes::from_static(b"bar"))
        );
    }

    #[test]
    fn get_missing_is_nil() {
        assert_eq!(handler().execute(cmd(&[b"GET", b"missng"])), RespValue::Null);
    }

    #[test]
    fn set_overwrites() {
        let h = handler();
        h.execute(cmd(&[b"SET", b"k", b"one"]));
        h.execute(cmd(&[b"SET", b"k", b"two"]));
        assert_eq!(
            h.execute(cmd(&[b"GET", b"k"])),
            RespValue::Bulk(Bytes::from_static(b"two"))
        );
    }

    #[test]
    fn set_empty_value_round_trips() {
        let h = handler();
        h.execute(cmd(&[b"SET", b"k", b""]));
        assert_eq!(h.execute(cmd(&[b"GET", b"k"])), RespValue::Bulk(Bytes::new()));
    }

    #[test]
    fn verbs_are_case_insensitive() {
        let h = handler();
        assert_eq!(h.execute(cmd(&[b"set", b"k", b"v"])), RespValue::ok());
        assert_eq!(
            h.execute(cmd(&[b"gEt", b"k"])),
            RespValue::Bulk(Bytes::from_static(b"v"))
        );
        assert_eq!(h.execute(cmd(&[b"del", b"k"])), RespValue::Integer(1));
    }

    #[test]
    fn del_counts_only_present_keys() {
        let h = handler();
        h.execute(cmd(&[b"SET", b"a", b"1"]));
        assert_eq!(
            h.execute(cmd(&[b"DEL", b"a", b"b"])),
            RespValue::Integer(1)
        );
    }

    #[test]
    fn del_absent_key_is_zero() {
        assert_eq!(handler().execute(cmd(&[b"DEL", b"nope"])), RespValue::Integer(0));
    }

    #[test]
    fn del_repeated_key_counts_once() {
        let h = handler();
        h.execute(cmd(&[b"SET", b"k", b"v"]));
        assert_eq!(
            h.execute(cmd(&[b"DEL", b"k", b"k", b"k"])),
            RespValue::Integer(1)
        );
    }

    #[test]
    fn unknown_command_is_an_error() {
        let reply = handler().execute(cmd(&[b"PING"]));
        assert!(reply.is_error());
    }

    #[test]
    fn wrong_arity_is_an_error() {
        let h = handler();
        assert!(h.execute(cmd(&[b"GET"])).is_error());
        assert!(h.execute(cmd(&[b"GET", b"a", b"b"])).is_error());
        assert!(h.execute(cmd(&[b"SET", b"a"])).is_error());
        assert!(h.execute(cmd(&[b"DEL"])).is_error());
    }

    #[test]
    fn non_bulk_arguments_are_an_error() {
        let h = handler();
        let frame = RespValue::Array(vec![
            RespValue::Bulk(Bytes::from_static(b"GET")),
            RespValue::Integer(42),
        ]);
        assert!(h.execute(frame).is_error());
    }

    #[test]
    fn non_array_frame_is_an_error() {
        assert!(handler().execute(RespValue::Integer(1)).is_error());
        assert!(handler()
            .execute(RespValue::Array(vec![]))
            .is_error());
    }

    #[test]
    fn errors_do_not_touch_storage() {
        let storage = Arc::new(StorageEngine::new());
        let h = CommandHandler::new(Arc::clone(&storage));
        h.execute(cmd(&[b"SET", b"k"]));
        h.execute(cmd(&[b"NOPE", b"k", b"v"]));
        assert!(storage.is_empty());
    }
}
