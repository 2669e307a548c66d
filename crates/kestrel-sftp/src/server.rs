//! TCP accept loop
//!
//! One [`Session`] per accepted connection; sessions run on their own
//! threads and the listener never blocks on them.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fs::{RootedFileSystem, SftpFileSystem};
use crate::session::Session;

/// Multi-connection SFTP server.
pub struct Server {
    config: Arc<Config>,
    fs: Arc<dyn SftpFileSystem>,
}

impl Server {
    /// Validates the configuration and jails the filesystem to the
    /// configured root.
    pub fn new(config: Config) -> Result<Server> {
        config.validate()?;
        let fs = RootedFileSystem::new(&config.root_dir).map_err(|e| {
            Error::Config(format!(
                "root directory {}: {e}",
                config.root_dir.display()
            ))
        })?;
        Ok(Server {
            config: Arc::new(config),
            fs: Arc::new(fs),
        })
    }

    /// Binds the listener and serves connections until the process ends.
    pub fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr())?;
        info!(
            event = "server_listening",
            addr = %self.config.listen_addr(),
            root_dir = ?self.config.root_dir,
            "SFTP server accepting connections"
        );

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(e) = self.serve_connection(stream) {
                        warn!(event = "session_spawn_failed", error = %e, "dropping connection");
                    }
                }
                Err(e) => warn!(event = "accept_failed", error = %e, "accept failed"),
            }
        }
        Ok(())
    }

    /// Spawns a session over an accepted stream. The session threads
    /// outlive this call; they exit when the client disconnects.
    pub fn serve_connection(&self, stream: TcpStream) -> Result<Session> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(event = "client_connected", %peer, "client connected");
        let input = stream.try_clone()?;
        Session::spawn(input, stream, Arc::clone(&self.fs), Arc::clone(&self.config))
    }
}
