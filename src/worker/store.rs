//! Redis-backed user records for the demo worker.
//!
//! Each user is a hash at `user:<name>`, and `users` is the set of known
//! names. Writes touch keys under `user:`, which is what the keyspace
//! watchers subscribe to.

use super::messages::{SetFavoriteNumber, User};
use redis::aio::ConnectionLike;

/// Upsert a user's favorite number.
pub(crate) async fn set_favorite<C: ConnectionLike>(
    conn: &mut C,
    cmd: &SetFavoriteNumber,
) -> redis::RedisResult<()> {
    let key = format!("user:{}", cmd.user_name);
    let _: () = redis::pipe()
        .hset(&key, "username", &cmd.user_name)
        .ignore()
        .hset(&key, "favnum", cmd.favorite_number)
        .ignore()
        .sadd("users", &cmd.user_name)
        .ignore()
        .query_async(conn)
        .await?;
    Ok(())
}

/// All users and their favorite numbers, sorted alphabetically by name.
pub(crate) async fn all_users<C: ConnectionLike>(conn: &mut C) -> redis::RedisResult<Vec<User>> {
    let rows: Vec<(String, i64)> = redis::cmd("SORT")
        .arg("users")
        .arg("ALPHA")
        .arg("BY")
        .arg("user:*->username")
        .arg("GET")
        .arg("user:*->username")
        .arg("GET")
        .arg("user:*->favnum")
        .query_async(conn)
        .await?;
    Ok(rows
        .into_iter()
        .map(|(username, favnum)| User { username, favnum })
        .collect())
}
