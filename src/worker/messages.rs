//! Wire types for the demo worker's business protocol.
//!
//! Field casing matches what clients already send, e.g.
//! `{"Cmd":1,"CmdData":{"UserName":"ana","FavoriteNumber":22}}`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Request discriminator: set a user's favorite number.
pub const CMD_SET_FAVORITE_NUMBER: u8 = 1;
/// Request discriminator: list all users.
pub const CMD_LIST_ALL_USERS: u8 = 2;
/// Reply discriminator: full user-list snapshot.
pub const REPLY_ALL_USERS: u8 = 1;

/// Minimal envelope carrying only the command discriminator. Parsed first;
/// the full payload is then decoded into the variant it selects.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Cmd")]
    cmd: u8,
}

#[derive(Debug, Deserialize)]
struct Command<T> {
    #[serde(rename = "CmdData")]
    cmd_data: T,
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Set a user's favorite number.
    SetFavoriteNumber(SetFavoriteNumber),
    /// List all users (sorted alphabetically) and their favorite numbers.
    ListAllUsers(ListQuery),
}

/// Payload of [`ClientRequest::SetFavoriteNumber`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SetFavoriteNumber {
    /// The user to update.
    #[serde(rename = "UserName")]
    pub user_name: String,
    /// Their new favorite number.
    #[serde(rename = "FavoriteNumber")]
    pub favorite_number: i64,
}

/// Payload of [`ClientRequest::ListAllUsers`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListQuery {
    /// Username of the requester.
    #[serde(rename = "UserName")]
    pub user_name: String,
}

/// Failure to decode a business payload. Logged and discarded by the
/// worker; never affects the connection.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not valid JSON, or does not match the shape the
    /// discriminator selects.
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The discriminator names no known command.
    #[error("unrecognized command discriminator: {0}")]
    UnknownCommand(u8),
}

/// Decode a business payload into a typed request.
pub fn decode(payload: &[u8]) -> Result<ClientRequest, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(payload)?;
    match envelope.cmd {
        CMD_SET_FAVORITE_NUMBER => {
            let cmd: Command<SetFavoriteNumber> = serde_json::from_slice(payload)?;
            Ok(ClientRequest::SetFavoriteNumber(cmd.cmd_data))
        }
        CMD_LIST_ALL_USERS => {
            let cmd: Command<ListQuery> = serde_json::from_slice(payload)?;
            Ok(ClientRequest::ListAllUsers(cmd.cmd_data))
        }
        other => Err(DecodeError::UnknownCommand(other)),
    }
}

/// One user record in a snapshot reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// The user's name.
    #[serde(rename = "Username")]
    pub username: String,
    /// Their favorite number.
    #[serde(rename = "Favnum")]
    pub favnum: i64,
}

/// Reply carrying the full, alphabetically sorted user snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserListReply {
    #[serde(rename = "Cmd")]
    cmd: u8,
    #[serde(rename = "Status")]
    status: &'static str,
    #[serde(rename = "Error")]
    error: String,
    /// All users and their favorite numbers.
    #[serde(rename = "AllUsers")]
    pub all_users: Vec<User>,
}

impl UserListReply {
    /// Build a successful snapshot reply.
    pub fn new(all_users: Vec<User>) -> Self {
        Self {
            cmd: REPLY_ALL_USERS,
            status: "OK",
            error: String::new(),
            all_users,
        }
    }

    /// Serialize the reply for publishing.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}
