use log::info;

use crate::error::Result;
use crate::networking::bind_listener;
use crate::relay::serve;

/// Run the transit relay server.
///
/// The relay is a blind matchmaker: it never sees plaintext and cannot
/// decrypt the record stream, it only pairs the two sides of a transfer by
/// the token they present and copies bytes between them.
///
/// # Arguments
/// * `port` - The port number to bind the relay server to
pub async fn run(port: u16) -> Result<()> {
    let listener = bind_listener(port)?;
    println!("Relay listening on 0.0.0.0:{}", port);
    info!("relay server started on port {}", port);

    serve(listener).await
}
