/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! The UDP receiver. Runs on a dedicated OS thread so the kernel receive
//! buffer is drained independently of the cooperative runtime: datagrams are
//! parsed into [`Packet`]s and emitted as batches into the dispatcher queue
//! once 300 packets have accumulated or 200 ms have passed. Malformed
//! datagrams are counted and dropped, socket timeouts flush partial batches.

use crate::{app::App, error::CallsonicResult, packet::Packet};
use crossbeam::channel::Sender;
use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};
use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    sync::{Arc, atomic::Ordering},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thread_priority::{
    RealtimeThreadSchedulePolicy, ThreadPriority, ThreadSchedulePolicy,
    set_thread_priority_and_policy, thread_native_id,
};
use tracing::{debug, error, info, warn};

const BATCH_MAX_PACKETS: usize = 300;
const BATCH_MAX_AGE: Duration = Duration::from_millis(200);
const SOCKET_READ_TIMEOUT: Duration = Duration::from_secs(1);
const ALIVE_LOG_INTERVAL: Duration = Duration::from_secs(30);

pub fn start_receiver(
    app: Arc<App>,
    batch_tx: Sender<Vec<Packet>>,
) -> CallsonicResult<JoinHandle<()>> {
    if !app.config.app_unicast_protocol.eq_ignore_ascii_case("udp") {
        error!(
            "only UDP protocol is supported, ignoring '{}'",
            app.config.app_unicast_protocol
        );
    }

    let socket = create_rx_socket(&app.config.app_unicast_host, app.config.app_unicast_port)?;
    info!(
        "socket {}:{} for receiving unicast packages started",
        app.config.app_unicast_host, app.config.app_unicast_port
    );

    let handle = thread::Builder::new()
        .name("unicast-rx".to_owned())
        .spawn(move || {
            set_realtime_priority();
            Receiver {
                app,
                socket,
                batch_tx,
                buffer_queue: Vec::new(),
                buffer_send_time: Instant::now(),
                alive_time: Instant::now(),
                count_received: 0,
            }
            .run()
        })?;

    Ok(handle)
}

pub fn create_rx_socket(host: &str, port: u16) -> CallsonicResult<UdpSocket> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| crate::error::CallsonicError::Other(format!("invalid bind address: {e}")))?;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;
    socket.bind(&SockAddr::from(addr))?;

    Ok(socket.into())
}

struct Receiver {
    app: Arc<App>,
    socket: UdpSocket,
    batch_tx: Sender<Vec<Packet>>,
    buffer_queue: Vec<Packet>,
    buffer_send_time: Instant,
    alive_time: Instant,
    count_received: u64,
}

impl Receiver {
    fn run(mut self) {
        info!("start waiting and receiving RTP packages");
        let mut receive_buffer = vec![0u8; self.app.config.app_unicast_buffer_size.max(1)];

        while self.app.is_alive() {
            match self.socket.recv_from(&mut receive_buffer) {
                Ok((len, addr)) => self.datagram_received(&receive_buffer[..len], addr),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    self.send_buffer();
                }
                Err(e) => {
                    self.send_buffer();
                    error!("socket error: {e}");
                }
            }
        }

        self.send_buffer();
        info!("receiver thread stopped");
    }

    fn datagram_received(&mut self, data: &[u8], addr: SocketAddr) {
        match Packet::parse(addr.ip(), addr.port(), data) {
            Ok(package) => {
                self.buffer_queue.push(package);
                self.count_received += 1;
                self.app
                    .stats
                    .packets_received
                    .fetch_add(1, Ordering::Relaxed);

                if self.buffer_queue.len() > BATCH_MAX_PACKETS
                    || self.buffer_send_time.elapsed() > BATCH_MAX_AGE
                {
                    self.send_buffer();
                }
            }
            Err(e) => {
                self.app
                    .stats
                    .packets_malformed
                    .fetch_add(1, Ordering::Relaxed);
                debug!("dropping malformed datagram from {addr}: {e}");
            }
        }
    }

    fn send_buffer(&mut self) {
        if !self.buffer_queue.is_empty() {
            let batch = std::mem::take(&mut self.buffer_queue);
            self.app
                .stats
                .batches_received
                .fetch_add(1, Ordering::Relaxed);
            if self.batch_tx.send(batch).is_err() {
                warn!("dispatcher queue is gone, dropping batch");
            }
            self.buffer_send_time = Instant::now();
        }

        if self.alive_time.elapsed() > ALIVE_LOG_INTERVAL {
            info!("alive, count_received={}", self.count_received);
            self.alive_time = Instant::now();
        }
    }
}

fn set_realtime_priority() {
    let pid = thread_native_id();
    if let Err(e) = set_thread_priority_and_policy(
        pid,
        ThreadPriority::Max,
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
    ) {
        warn!("Could not set thread priority: {e}");
    } else {
        info!("Successfully set real time priority for thread {pid}.");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::Config, template::TemplateLibrary};
    use crossbeam::channel::unbounded;

    #[test]
    fn receives_parses_and_batches_datagrams() {
        let mut config = Config::default();
        config.app_unicast_host = "127.0.0.1".to_owned();
        config.app_unicast_port = 0;

        let socket = create_rx_socket("127.0.0.1", 0).expect("socket binds");
        let local_addr = socket.local_addr().expect("bound");

        let app = App::new(config, TemplateLibrary::empty());
        let (batch_tx, batch_rx) = unbounded();

        let receiver_app = app.clone();
        let handle = thread::spawn(move || {
            Receiver {
                app: receiver_app,
                socket,
                batch_tx,
                buffer_queue: Vec::new(),
                buffer_send_time: Instant::now(),
                alive_time: Instant::now(),
                count_received: 0,
            }
            .run()
        });

        let client = UdpSocket::bind("127.0.0.1:0").expect("client socket");
        let rtp: Vec<u8> = vec![
            0x80, 0x00, 0x00, 0x2A, 0, 0, 0, 0, 0xDE, 0xAD, 0xBE, 0xEF, 0x12, 0x34, 0x56, 0x78,
        ];
        client.send_to(&rtp, local_addr).expect("datagram sent");
        // garbage datagram is dropped with a counter
        client.send_to(&[0x80, 0x00], local_addr).expect("datagram sent");

        let batch = batch_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("batch arrives on timeout flush");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].seq_num, 42);

        assert_eq!(app.stats.packets_received.load(Ordering::Relaxed), 1);
        assert_eq!(app.stats.packets_malformed.load(Ordering::Relaxed), 1);

        app.shutdown();
        handle.join().expect("receiver thread exits");
    }
}
