// Command objects routed by the cluster engine

use crate::error::{ClusterError, Result};
use crate::pool::Connection;
use crate::protocol::RespValue;
use std::collections::HashMap;

/// A single command: its arguments plus the reply or error slot the
/// dispatcher fills in. The engine never looks at a command's payload
/// beyond the first key needed for routing.
#[derive(Debug, Clone, Default)]
pub struct Cmd {
    args: Vec<Vec<u8>>,
    reply: Option<RespValue>,
    err: Option<ClusterError>,
    key_pos: Option<usize>,
}

impl Cmd {
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Self {
            args: vec![name.as_ref().to_vec()],
            ..Default::default()
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(arg.as_ref().to_vec());
        self
    }

    /// Override the first-key position used for slot routing, for
    /// commands absent from the server's catalog
    pub fn key_pos(mut self, pos: usize) -> Self {
        self.key_pos = Some(pos);
        self
    }

    /// Lowercased command name, the catalog lookup key
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_lowercase()
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Argument bytes at position `i`, empty when out of range
    pub fn arg_bytes(&self, i: usize) -> &[u8] {
        self.args.get(i).map(Vec::as_slice).unwrap_or(b"")
    }

    pub fn key_pos_hint(&self) -> Option<usize> {
        self.key_pos
    }

    pub fn reply(&self) -> Option<&RespValue> {
        self.reply.as_ref()
    }

    pub fn take_reply(&mut self) -> Option<RespValue> {
        self.reply.take()
    }

    pub fn err(&self) -> Option<&ClusterError> {
        self.err.as_ref()
    }

    pub fn set_err(&mut self, err: ClusterError) {
        self.err = Some(err);
    }

    /// Read this command's reply from a connection. Server error
    /// replies land in the error slot, everything else in the reply
    /// slot; a retried command overwrites its previous outcome.
    pub(crate) async fn read_reply(&mut self, conn: &mut Connection) -> Result<()> {
        match conn.read_reply().await {
            Ok(RespValue::Error(msg)) => {
                let err = ClusterError::Server(msg);
                self.err = Some(err.clone());
                self.reply = None;
                Err(err)
            }
            Ok(value) => {
                self.reply = Some(value);
                self.err = None;
                Ok(())
            }
            Err(err) => {
                self.err = Some(err.clone());
                Err(err)
            }
        }
    }
}

/// Catalog entry from the server's COMMAND reply, trimmed to what
/// routing needs
#[derive(Debug, Clone)]
pub struct CommandInfo {
    pub name: String,
    pub arity: i64,
    pub first_key_pos: usize,
    pub read_only: bool,
}

/// Parse a COMMAND reply into a name-keyed catalog. Malformed entries
/// are skipped; an unknown command simply routes by random slot.
pub(crate) fn parse_command_catalog(reply: &RespValue) -> HashMap<String, CommandInfo> {
    let mut catalog = HashMap::new();
    let Some(entries) = reply.as_array() else {
        return catalog;
    };

    for entry in entries {
        let Some(fields) = entry.as_array() else {
            continue;
        };
        if fields.len() < 4 {
            continue;
        }
        let Some(name) = fields[0].as_text() else {
            continue;
        };
        let name = name.to_lowercase();
        let Some(arity) = fields[1].as_integer() else {
            continue;
        };
        let read_only = fields[2]
            .as_array()
            .map(|flags| flags.iter().any(|f| f.as_text() == Some("readonly")))
            .unwrap_or(false);
        let first_key_pos = fields[3].as_integer().unwrap_or(0).max(0) as usize;

        catalog.insert(
            name.clone(),
            CommandInfo {
                name,
                arity,
                first_key_pos,
                read_only,
            },
        );
    }
    catalog
}

/// First-key position for slot routing. An explicit hint on the command
/// wins; a few commands place keys behind a numkeys argument and are
/// special-cased; everything else trusts the catalog.
pub(crate) fn first_key_pos(cmd: &Cmd, info: Option<&CommandInfo>) -> usize {
    if let Some(pos) = cmd.key_pos_hint() {
        return pos;
    }
    match cmd.name().as_str() {
        "eval" | "evalsha" => {
            if cmd.arg_bytes(2) != b"0" {
                3
            } else {
                0
            }
        }
        "publish" => 1,
        _ => info.map(|i| i.first_key_pos).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_builder() {
        let cmd = Cmd::new("GET").arg("foo");
        assert_eq!(cmd.name(), "get");
        assert_eq!(cmd.args().len(), 2);
        assert_eq!(cmd.arg_bytes(1), b"foo");
        assert_eq!(cmd.arg_bytes(5), b"");
    }

    #[test]
    fn test_cmd_err_slot() {
        let mut cmd = Cmd::new("GET").arg("foo");
        assert!(cmd.err().is_none());
        cmd.set_err(ClusterError::NoState);
        assert!(matches!(cmd.err(), Some(ClusterError::NoState)));
    }

    #[test]
    fn test_parse_command_catalog() {
        let reply = RespValue::Array(Some(vec![
            RespValue::Array(Some(vec![
                RespValue::BulkString(Some(b"get".to_vec())),
                RespValue::Integer(2),
                RespValue::Array(Some(vec![
                    RespValue::SimpleString("readonly".to_string()),
                    RespValue::SimpleString("fast".to_string()),
                ])),
                RespValue::Integer(1),
                RespValue::Integer(1),
                RespValue::Integer(1),
            ])),
            RespValue::Array(Some(vec![
                RespValue::BulkString(Some(b"set".to_vec())),
                RespValue::Integer(-3),
                RespValue::Array(Some(vec![RespValue::SimpleString(
                    "write".to_string(),
                )])),
                RespValue::Integer(1),
                RespValue::Integer(1),
                RespValue::Integer(1),
            ])),
            // malformed entry is skipped
            RespValue::Integer(7),
        ]));

        let catalog = parse_command_catalog(&reply);
        assert_eq!(catalog.len(), 2);

        let get = &catalog["get"];
        assert!(get.read_only);
        assert_eq!(get.first_key_pos, 1);
        assert_eq!(get.arity, 2);

        let set = &catalog["set"];
        assert!(!set.read_only);
        assert_eq!(set.first_key_pos, 1);
    }

    #[test]
    fn test_first_key_pos_hint_wins() {
        let cmd = Cmd::new("OBSCURE").arg("k").key_pos(1);
        assert_eq!(first_key_pos(&cmd, None), 1);
    }

    #[test]
    fn test_first_key_pos_eval() {
        let with_keys = Cmd::new("EVAL").arg("return 1").arg("1").arg("k");
        assert_eq!(first_key_pos(&with_keys, None), 3);

        let without_keys = Cmd::new("EVAL").arg("return 1").arg("0");
        assert_eq!(first_key_pos(&without_keys, None), 0);
    }

    #[test]
    fn test_first_key_pos_from_catalog() {
        let info = CommandInfo {
            name: "getrange".to_string(),
            arity: 4,
            first_key_pos: 1,
            read_only: true,
        };
        let cmd = Cmd::new("GETRANGE").arg("k").arg("0").arg("-1");
        assert_eq!(first_key_pos(&cmd, Some(&info)), 1);
        assert_eq!(first_key_pos(&Cmd::new("PING"), None), 0);
    }
}
