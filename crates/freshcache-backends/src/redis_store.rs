//! Redis cache store over a weighted pool of servers
//!
//! Each physical key is routed to one server by weighted hashing, so a
//! server only ever sees its own share of the keyspace. Expiry is native
//! (`SET .. EX`), `add` is `SET .. NX` and `flush` issues `FLUSHDB` on
//! every server.

use std::{collections::HashMap, time::Duration};

use freshcache::{store::CacheStore, PhysicalKey, Result};
use parking_lot::Mutex;
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisResult};
use tracing::{debug, warn};

use crate::{
    config::RedisServer,
    error::{BackendError, BackendResult},
};

fn connect_timeout(server: &RedisServer) -> Duration {
    Duration::from_millis(server.timeout_ms.max(1))
}

fn connection_info(server: &RedisServer) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(server.host.clone(), server.port),
        redis: RedisConnectionInfo {
            db: server.database,
            password: server.password.clone(),
            ..Default::default()
        },
    }
}

struct PooledServer {
    config: RedisServer,
    client: Client,
    connection: Mutex<Option<redis::Connection>>,
}

/// Networked cache store
pub struct RedisStore {
    servers: Vec<PooledServer>,
    /// Cumulative weights, parallel to `servers`
    ring: Vec<u64>,
}

impl RedisStore {
    /// Create a store over `servers`; connections are opened lazily
    pub fn new(servers: Vec<RedisServer>) -> BackendResult<Self> {
        if servers.is_empty() {
            return Err(BackendError::InvalidConfig(
                "redis store needs at least one server".to_string(),
            ));
        }

        let mut ring = Vec::with_capacity(servers.len());
        let mut total = 0u64;
        for server in &servers {
            if server.host.is_empty() {
                return Err(BackendError::InvalidConfig(
                    "redis server host must not be empty".to_string(),
                ));
            }
            total += u64::from(server.weight);
            ring.push(total);
        }
        if total == 0 {
            return Err(BackendError::InvalidConfig(
                "at least one redis server needs a positive weight".to_string(),
            ));
        }

        let servers = servers
            .into_iter()
            .map(|config| {
                Ok(PooledServer {
                    client: Client::open(connection_info(&config))?,
                    config,
                    connection: Mutex::new(None),
                })
            })
            .collect::<BackendResult<Vec<_>>>()?;

        Ok(Self { servers, ring })
    }

    /// Single-server store
    pub fn single(host: impl Into<String>, port: u16) -> BackendResult<Self> {
        Self::new(vec![RedisServer::new(host, port)])
    }

    /// Index of the server that owns `key`
    pub fn route(&self, key: &PhysicalKey) -> usize {
        let total = self.ring.last().copied().unwrap_or(1).max(1);
        // Physical keys are uniformly distributed hex, so their prefix is a fair hash
        let hash = u64::from_str_radix(&key.as_str()[..16], 16).unwrap_or_default();
        let point = hash % total;
        self.ring.partition_point(|&bound| bound <= point)
    }

    pub fn servers(&self) -> impl Iterator<Item = &RedisServer> {
        self.servers.iter().map(|server| &server.config)
    }

    /// Run `command` on the server at `index`, reconnecting as needed.
    ///
    /// A failed command drops the cached connection so the next call starts
    /// from a fresh socket.
    fn with_connection<T, F>(&self, index: usize, command: F) -> BackendResult<T>
    where
        F: FnOnce(&mut redis::Connection) -> RedisResult<T>,
    {
        let server = &self.servers[index];
        let mut slot = server.connection.lock();

        if slot.is_none() {
            let timeout = connect_timeout(&server.config);
            let connection = server.client.get_connection_with_timeout(timeout)?;
            connection.set_read_timeout(Some(timeout))?;
            connection.set_write_timeout(Some(timeout))?;
            debug!(
                "Connected to redis server {}:{}",
                server.config.host, server.config.port
            );
            *slot = Some(connection);
        }

        let Some(connection) = slot.as_mut() else {
            return Err(BackendError::InvalidConfig("redis connection unavailable".to_string()));
        };
        match command(connection) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(
                    "Redis command failed on {}:{}: {}",
                    server.config.host, server.config.port, e
                );
                *slot = None;
                Err(e.into())
            }
        }
    }

    fn fetch(&self, key: &PhysicalKey) -> BackendResult<Option<Vec<u8>>> {
        self.with_connection(self.route(key), |conn| {
            redis::cmd("GET").arg(key.as_str()).query(conn)
        })
    }

    fn fetch_many(&self, keys: &[PhysicalKey]) -> BackendResult<HashMap<PhysicalKey, Vec<u8>>> {
        let mut by_server: HashMap<usize, Vec<&PhysicalKey>> = HashMap::new();
        for key in keys {
            by_server.entry(self.route(key)).or_default().push(key);
        }

        let mut found = HashMap::with_capacity(keys.len());
        for (index, group) in by_server {
            let values: Vec<Option<Vec<u8>>> = self.with_connection(index, |conn| {
                let mut cmd = redis::cmd("MGET");
                for key in &group {
                    cmd.arg(key.as_str());
                }
                cmd.query(conn)
            })?;

            for (key, value) in group.into_iter().zip(values) {
                if let Some(payload) = value {
                    found.insert(key.clone(), payload);
                }
            }
        }
        Ok(found)
    }

    fn store(
        &self,
        key: &PhysicalKey,
        payload: &[u8],
        ttl_secs: u64,
        only_if_absent: bool,
    ) -> BackendResult<bool> {
        let reply: redis::Value = self.with_connection(self.route(key), |conn| {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key.as_str()).arg(payload);
            if ttl_secs > 0 {
                cmd.arg("EX").arg(ttl_secs);
            }
            if only_if_absent {
                cmd.arg("NX");
            }
            cmd.query(conn)
        })?;
        // NX replies nil when the key already exists
        Ok(!matches!(reply, redis::Value::Nil))
    }

    fn remove(&self, key: &PhysicalKey) -> BackendResult<bool> {
        let _removed: i64 = self.with_connection(self.route(key), |conn| {
            redis::cmd("DEL").arg(key.as_str()).query(conn)
        })?;
        Ok(true)
    }

    fn flush_all(&self) -> BackendResult<bool> {
        let mut flushed = true;
        for index in 0..self.servers.len() {
            let result: BackendResult<()> =
                self.with_connection(index, |conn| redis::cmd("FLUSHDB").query(conn));
            if let Err(e) = result {
                warn!("FLUSHDB failed on server {}: {}", index, e);
                flushed = false;
            }
        }
        Ok(flushed)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("servers", &self.servers().collect::<Vec<_>>())
            .finish()
    }
}

impl CacheStore for RedisStore {
    fn get_raw(&self, key: &PhysicalKey) -> Result<Option<Vec<u8>>> {
        Ok(self.fetch(key)?)
    }

    fn get_many_raw(&self, keys: &[PhysicalKey]) -> Result<HashMap<PhysicalKey, Vec<u8>>> {
        Ok(self.fetch_many(keys)?)
    }

    fn set_raw(&self, key: &PhysicalKey, payload: &[u8], ttl_secs: u64) -> Result<bool> {
        Ok(self.store(key, payload, ttl_secs, false)?)
    }

    fn add_raw(&self, key: &PhysicalKey, payload: &[u8], ttl_secs: u64) -> Result<bool> {
        Ok(self.store(key, payload, ttl_secs, true)?)
    }

    fn delete_raw(&self, key: &PhysicalKey) -> Result<bool> {
        Ok(self.remove(key)?)
    }

    fn flush_raw(&self) -> Result<bool> {
        Ok(self.flush_all()?)
    }
}
