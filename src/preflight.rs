/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// True if something already accepts connections on `host:port`. A guest launched now would
/// fail to bind the forwarded port and readiness would measure the wrong service.
pub async fn port_in_use(host: &str, port: u16) -> bool {
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => {
            debug!("{}:{} already accepts connections", host, port);
            true
        }
        _ => false,
    }
}
