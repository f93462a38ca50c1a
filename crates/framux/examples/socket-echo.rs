//! Fragmented echo over a Unix socket pair.
//!
//! The client sends one text message split across two frames. The second
//! frame is written from another thread before it is active: that thread
//! parks until the first frame closes and the multiplexer hands it the
//! socket. The server reassembles the message and echoes it back.
//!
//! Run with:
//!   FRAMUX_LOG=debug cargo run --example socket-echo

use std::sync::Arc;
use std::thread;

use bytes::BytesMut;
use framux::frame::{
    encode_close_payload, FrameConfig, FrameMultiplexer, FrameType, Result, SourceFrameChannel,
};
use framux::logging::init_from_env;
use framux::transport::{SocketChannel, StreamSource};

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_from_env();
    let (client_end, server_end) = SocketChannel::pair()?;
    let server = thread::spawn(move || serve(server_end));

    let client = FrameMultiplexer::from_duplex(Arc::clone(&client_end), FrameConfig::client());
    let first = client.send(FrameType::Text, Some(6))?;
    first.set_final_fragment(false)?;
    let second = client.send(FrameType::Continuation, Some(6))?;

    let late_writer = {
        let second = Arc::clone(&second);
        thread::spawn(move || -> Result<()> {
            // blocks until `first` is closed
            second.write_all(b" world")?;
            second.close()
        })
    };

    first.write_all(b"hello,")?;
    first.close()?;
    late_writer
        .join()
        .map_err(|_| "continuation writer panicked")??;

    let mut reason = BytesMut::new();
    encode_close_payload(1000, "done", &mut reason)?;
    let close = client.send(FrameType::Close, None)?;
    close.write_all(&reason)?;
    close.close()?;

    loop {
        let frame = next_frame(&client, &client_end)?;
        let payload = read_payload(&frame)?;
        frame.close()?;
        match frame.frame_type() {
            FrameType::Close => {
                eprintln!("client: server closed the connection");
                break;
            }
            other => eprintln!(
                "client: {other} echo {:?}",
                String::from_utf8_lossy(&payload)
            ),
        }
    }

    server.join().map_err(|_| "server panicked")??;
    Ok(())
}

fn serve(channel: Arc<SocketChannel>) -> Result<()> {
    let mux = FrameMultiplexer::from_duplex(Arc::clone(&channel), FrameConfig::server());
    let mut message = Vec::new();
    loop {
        let frame = next_frame(&mux, &channel)?;
        let payload = read_payload(&frame)?;
        frame.close()?;

        match frame.frame_type() {
            FrameType::Close => {
                let reply = mux.send(FrameType::Close, None)?;
                reply.write_all(&payload)?;
                reply.close()?;
                return Ok(());
            }
            FrameType::Ping => {
                let pong = mux.send(FrameType::Pong, None)?;
                pong.write_all(&payload)?;
                pong.close()?;
            }
            _ => {
                message.extend_from_slice(&payload);
                if frame.is_final_fragment() {
                    eprintln!("server: message {:?}", String::from_utf8_lossy(&message));
                    let echo = mux.send(FrameType::Binary, Some(message.len() as u64))?;
                    echo.write_all(&message)?;
                    echo.close()?;
                    message.clear();
                }
            }
        }
    }
}

fn next_frame(mux: &FrameMultiplexer, channel: &SocketChannel) -> Result<Arc<SourceFrameChannel>> {
    loop {
        if let Some(frame) = mux.receive()? {
            return Ok(frame);
        }
        channel.await_readable()?;
    }
}

fn read_payload(frame: &SourceFrameChannel) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(frame.payload_size() as usize);
    let mut buf = [0u8; 1024];
    while !frame.is_complete() {
        let n = frame.read(&mut buf)?;
        if n == 0 {
            frame.await_readable()?;
            continue;
        }
        payload.extend_from_slice(&buf[..n]);
    }
    Ok(payload)
}
