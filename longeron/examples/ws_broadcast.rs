//! Accept a few WebSocket peers and broadcast a counter to all of them.
//!
//! Run with `RUST_LOG=debug cargo run --example ws_broadcast` and connect
//! with any WebSocket client to `ws://127.0.0.1:5555/`.

use longeron::prelude::*;
use std::time::Duration;

#[compio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    longeron::dev_tracing::init_tracing();

    let options = WsOptions::new().with_msg_type(Opcode::Text);
    let mut listener = WsListener::bind("127.0.0.1:5555", options).await?;
    println!("listening on {}", listener.local_addr());

    let mut fanout = Fanout::new();
    let mut peers = Vec::new();
    for _ in 0..2 {
        let ws = listener.accept().await?;
        println!("peer {} connected from {:?}", ws.id(), ws.peer_addr());
        let key = fanout.add(ws.pipe());
        fanout.writable(key);
        peers.push((key, ws));
    }

    for tick in 0..10u32 {
        let delivered = fanout.send(Message::from_slice(format!("tick {tick}").as_bytes())?);
        println!("tick {tick} -> {delivered} peers");
        compio::time::sleep(Duration::from_millis(500)).await;
        for (key, ws) in &peers {
            if ws.pipe().is_writable() {
                fanout.writable(*key);
            }
        }
    }
    Ok(())
}
