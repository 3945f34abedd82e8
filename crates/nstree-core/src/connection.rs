//! Client connection strings: `[numconnections=<1..15>|]<host>:<port>[;<host>:<port>...]`.

use std::fmt;

use crate::types::TreeError;

/// Largest accepted connection count
pub const MAX_CONNECTIONS: u32 = 15;

const NUM_CONNECTIONS_PREFIX: &str = "numconnections=";

/// Builds a connection string from endpoints and a connection count
#[derive(Debug, Clone)]
pub struct ConnectionStringBuilder {
    num_connections: u32,
    endpoints: Vec<String>,
}

impl Default for ConnectionStringBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStringBuilder {
    /// Creates a builder with one connection and no endpoints.
    pub fn new() -> Self {
        Self {
            num_connections: 1,
            endpoints: Vec::new(),
        }
    }

    /// Sets the number of connections, which must lie in `[1, 15]`.
    pub fn set_num_connections(&mut self, count: u32) -> Result<&mut Self, TreeError> {
        if !(1..=MAX_CONNECTIONS).contains(&count) {
            return Err(TreeError::InvalidArgument(format!(
                "connection count {} outside [1, {}]",
                count, MAX_CONNECTIONS
            )));
        }
        self.num_connections = count;
        Ok(self)
    }

    /// Returns the configured connection count
    pub fn num_connections(&self) -> u32 {
        self.num_connections
    }

    /// Adds an endpoint of the exact form `<host>:<port>`. Duplicates are ignored.
    pub fn add_endpoint(&mut self, endpoint: &str) -> Result<&mut Self, TreeError> {
        validate_endpoint(endpoint)?;
        if !self.endpoints.iter().any(|e| e == endpoint) {
            self.endpoints.push(endpoint.to_string());
        }
        Ok(self)
    }

    /// Removes an endpoint, returning whether it was present
    pub fn remove_endpoint(&mut self, endpoint: &str) -> bool {
        let before = self.endpoints.len();
        self.endpoints.retain(|e| e != endpoint);
        before != self.endpoints.len()
    }

    /// Endpoints in insertion order
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Renders the connection string. Fails when no endpoint was added.
    pub fn build(&self) -> Result<String, TreeError> {
        if self.endpoints.is_empty() {
            return Err(TreeError::InvalidArgument(
                "connection string needs at least one endpoint".to_string(),
            ));
        }
        let hosts = self.endpoints.join(";");
        if self.num_connections > 1 {
            Ok(format!(
                "{}{}|{}",
                NUM_CONNECTIONS_PREFIX, self.num_connections, hosts
            ))
        } else {
            Ok(hosts)
        }
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), TreeError> {
    let parts: Vec<&str> = endpoint.split(':').collect();
    if parts.len() != 2 || parts[0].trim().is_empty() || parts[0] != parts[0].trim() {
        return Err(TreeError::InvalidArgument(format!(
            "endpoint '{}' is not <host>:<port>",
            endpoint
        )));
    }
    if parts[0].contains(';') || parts[0].contains('|') {
        return Err(TreeError::InvalidArgument(format!(
            "endpoint '{}' has a separator in its host",
            endpoint
        )));
    }
    parts[1].parse::<u16>().map_err(|_| {
        TreeError::InvalidArgument(format!("endpoint '{}' has an invalid port", endpoint))
    })?;
    Ok(())
}

/// A parsed connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    /// Number of connections, 1 when the prefix is absent
    pub num_connections: u32,
    /// Endpoints in textual order
    pub endpoints: Vec<String>,
}

impl ConnectionString {
    /// Parses a connection string of the grammar produced by [`ConnectionStringBuilder`].
    pub fn parse(input: &str) -> Result<Self, TreeError> {
        let mut builder = ConnectionStringBuilder::new();
        let hosts = match input.split_once('|') {
            Some((prefix, rest)) => {
                let count = prefix
                    .strip_prefix(NUM_CONNECTIONS_PREFIX)
                    .ok_or_else(|| {
                        TreeError::InvalidArgument(format!("unknown prefix '{}'", prefix))
                    })?
                    .parse::<u32>()
                    .map_err(|e| {
                        TreeError::InvalidArgument(format!("bad connection count: {}", e))
                    })?;
                builder.set_num_connections(count)?;
                rest
            }
            None => input,
        };
        for endpoint in hosts.split(';') {
            builder.add_endpoint(endpoint)?;
        }
        if builder.endpoints.is_empty() {
            return Err(TreeError::InvalidArgument(
                "connection string has no endpoints".to_string(),
            ));
        }
        Ok(Self {
            num_connections: builder.num_connections,
            endpoints: builder.endpoints,
        })
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.num_connections > 1 {
            write!(f, "{}{}|", NUM_CONNECTIONS_PREFIX, self.num_connections)?;
        }
        write!(f, "{}", self.endpoints.join(";"))
    }
}
