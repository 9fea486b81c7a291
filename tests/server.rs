//! End-to-end tests against a live server.
//!
//! Each test boots a full pipeline on an ephemeral port and talks to it over
//! plain blocking sockets, the way any RESP client would.

use relaykv::{Config, Server};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

fn start_server() -> Server {
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        workers_per_stage: 2,
        ..Config::default()
    };
    Server::bind(&config).expect("server should start")
}

fn start_server_with_cap(buffer_cap: usize) -> Server {
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        workers_per_stage: 2,
        buffer_cap,
        ..Config::default()
    };
    Server::bind(&config).expect("server should start")
}

fn connect(server: &Server) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr()).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

fn expect_reply(stream: &mut TcpStream, expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];
    stream.read_exact(&mut buf).expect("reply");
    assert_eq!(
        buf,
        expected,
        "got {:?}, want {:?}",
        String::from_utf8_lossy(&buf),
        String::from_utf8_lossy(expected)
    );
}

fn read_line(stream: &mut TcpStream) -> Vec<u8> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).expect("line");
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return line;
        }
    }
}

#[test]
fn set_then_get() {
    let mut server = start_server();
    let mut client = connect(&server);

    client
        .write_all(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n")
        .unwrap();
    expect_reply(&mut client, b"+OK\r\n");

    client.write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").unwrap();
    expect_reply(&mut client, b"$3\r\nbar\r\n");

    server.shutdown();
}

#[test]
fn get_of_missing_key_is_nil() {
    let mut server = start_server();
    let mut client = connect(&server);

    client
        .write_all(b"*2\r\n$3\r\nGET\r\n$6\r\nmissng\r\n")
        .unwrap();
    expect_reply(&mut client, b"$-1\r\n");

    server.shutdown();
}

#[test]
fn del_counts_only_keys_that_existed() {
    let mut server = start_server();
    let mut client = connect(&server);

    client
        .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n")
        .unwrap();
    expect_reply(&mut client, b"+OK\r\n");

    client
        .write_all(b"*3\r\n$3\r\nDEL\r\n$1\r\na\r\n$1\r\nb\r\n")
        .unwrap();
    expect_reply(&mut client, b":1\r\n");

    server.shutdown();
}

#[test]
fn del_of_absent_key_is_zero() {
    let mut server = start_server();
    let mut client = connect(&server);

    client.write_all(b"*2\r\n$3\r\nDEL\r\n$1\r\nk\r\n").unwrap();
    expect_reply(&mut client, b":0\r\n");

    server.shutdown();
}

#[test]
fn del_with_repeated_keys_counts_once() {
    let mut server = start_server();
    let mut client = connect(&server);

    client
        .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
        .unwrap();
    expect_reply(&mut client, b"+OK\r\n");

    client
        .write_all(b"*4\r\n$3\r\nDEL\r\n$1\r\nk\r\n$1\r\nk\r\n$1\r\nk\r\n")
        .unwrap();
    expect_reply(&mut client, b":1\r\n");

    server.shutdown();
}

#[test]
fn set_get_del_get_cycle() {
    let mut server = start_server();
    let mut client = connect(&server);

    client
        .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
        .unwrap();
    expect_reply(&mut client, b"+OK\r\n");
    client.write_all(b"*2\r\n$3\r\nDEL\r\n$1\r\nk\r\n").unwrap();
    expect_reply(&mut client, b":1\r\n");
    client.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").unwrap();
    expect_reply(&mut client, b"$-1\r\n");

    server.shutdown();
}

#[test]
fn pipelined_commands_reply_in_order() {
    let mut server = start_server();
    let mut client = connect(&server);

    client
        .write_all(
            b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n\
              *3\r\n$3\r\nSET\r\n$2\r\nk2\r\n$2\r\nv2\r\n\
              *2\r\n$3\r\nGET\r\n$2\r\nk1\r\n",
        )
        .unwrap();
    expect_reply(&mut client, b"+OK\r\n+OK\r\n$2\r\nv1\r\n");

    server.shutdown();
}

#[test]
fn long_pipeline_crosses_the_batch_cap_in_order() {
    let mut server = start_server();
    let mut client = connect(&server);

    // 100 SET/GET pairs: well past the per-job frame batch, so the
    // connection bounces between the execute and write stages mid-stream.
    let mut request = Vec::new();
    let mut expected = Vec::new();
    for i in 0..100 {
        let key = format!("key{i:03}");
        let value = format!("val{i:03}");
        request.extend_from_slice(
            format!(
                "*3\r\n$3\r\nSET\r\n${}\r\n{}\r\n${}\r\n{}\r\n",
                key.len(),
                key,
                value.len(),
                value
            )
            .as_bytes(),
        );
        request
            .extend_from_slice(format!("*2\r\n$3\r\nGET\r\n${}\r\n{}\r\n", key.len(), key).as_bytes());
        expected.extend_from_slice(format!("+OK\r\n${}\r\n{}\r\n", value.len(), value).as_bytes());
    }

    client.write_all(&request).unwrap();
    expect_reply(&mut client, &expected);

    server.shutdown();
}

#[test]
fn command_sent_one_byte_at_a_time_still_works() {
    let mut server = start_server();
    let mut client = connect(&server);
    client.set_nodelay(true).unwrap();

    for &byte in b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n".iter() {
        client.write_all(&[byte]).unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    expect_reply(&mut client, b"+OK\r\n");

    for &byte in b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n".iter() {
        client.write_all(&[byte]).unwrap();
    }
    expect_reply(&mut client, b"$3\r\nbar\r\n");

    server.shutdown();
}

#[test]
fn unknown_command_keeps_the_connection_open() {
    let mut server = start_server();
    let mut client = connect(&server);

    client.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();
    let line = read_line(&mut client);
    assert!(
        line.starts_with(b"-ERR"),
        "got {:?}",
        String::from_utf8_lossy(&line)
    );

    // The connection survives an application error.
    client
        .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
        .unwrap();
    expect_reply(&mut client, b"+OK\r\n");

    server.shutdown();
}

#[test]
fn wrong_arity_keeps_the_connection_open() {
    let mut server = start_server();
    let mut client = connect(&server);

    client.write_all(b"*1\r\n$3\r\nGET\r\n").unwrap();
    let line = read_line(&mut client);
    assert!(line.starts_with(b"-ERR"));

    client.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").unwrap();
    expect_reply(&mut client, b"$-1\r\n");

    server.shutdown();
}

#[test]
fn garbage_gets_a_protocol_error_and_a_closed_connection() {
    let mut server = start_server();
    let mut client = connect(&server);

    client.write_all(b"hello\r\n").unwrap();
    expect_reply(&mut client, b"-ERR protocol error\r\n");

    // The server hangs up after the error reply drains.
    let mut buf = [0u8; 16];
    match client.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected bytes after close: {:?}", &buf[..n]),
        Err(_) => {}
    }

    server.shutdown();
}

#[test]
fn empty_value_round_trips() {
    let mut server = start_server();
    let mut client = connect(&server);

    client
        .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$0\r\n\r\n")
        .unwrap();
    expect_reply(&mut client, b"+OK\r\n");
    client.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").unwrap();
    expect_reply(&mut client, b"$0\r\n\r\n");

    server.shutdown();
}

#[test]
fn binary_value_round_trips() {
    let mut server = start_server();
    let mut client = connect(&server);

    let value = b"\x00\x01\r\n\xff\xfe";
    let mut request = Vec::new();
    request.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$3\r\nbin\r\n$7\r\n");
    request.extend_from_slice(value);
    request.extend_from_slice(b"\r\n");
    client.write_all(&request).unwrap();
    expect_reply(&mut client, b"+OK\r\n");

    client.write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nbin\r\n").unwrap();
    let mut expected = Vec::new();
    expected.extend_from_slice(b"$7\r\n");
    expected.extend_from_slice(value);
    expected.extend_from_slice(b"\r\n");
    expect_reply(&mut client, &expected);

    server.shutdown();
}

#[test]
fn large_value_survives_short_writes() {
    let mut server = start_server();
    let mut client = connect(&server);

    // 1 MiB is far beyond a socket send buffer, so the reply drains across
    // several write-readiness cycles.
    let value: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let mut request = Vec::new();
    request.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$3\r\nbig\r\n");
    request.extend_from_slice(format!("${}\r\n", value.len()).as_bytes());
    request.extend_from_slice(&value);
    request.extend_from_slice(b"\r\n");
    client.write_all(&request).unwrap();
    expect_reply(&mut client, b"+OK\r\n");

    client.write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nbig\r\n").unwrap();
    let mut expected = Vec::new();
    expected.extend_from_slice(format!("${}\r\n", value.len()).as_bytes());
    expected.extend_from_slice(&value);
    expected.extend_from_slice(b"\r\n");
    expect_reply(&mut client, &expected);

    server.shutdown();
}

#[test]
fn slow_client_is_dropped_once_the_output_cap_is_hit() {
    let mut server = start_server_with_cap(64 * 1024);
    let mut client = connect(&server);

    // A 31 KiB value: the SET fits comfortably under the cap on the way in,
    // but three queued GET replies blow past it on the way out.
    let value = vec![b'v'; 31 * 1024];
    let mut request = Vec::new();
    request.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$3\r\nbig\r\n");
    request.extend_from_slice(format!("${}\r\n", value.len()).as_bytes());
    request.extend_from_slice(&value);
    request.extend_from_slice(b"\r\n");
    client.write_all(&request).unwrap();
    expect_reply(&mut client, b"+OK\r\n");

    // Queue ~2 MiB of replies in one burst and never read them.
    let mut flood = Vec::new();
    for _ in 0..64 {
        flood.extend_from_slice(b"*2\r\n$3\r\nGET\r\n$3\r\nbig\r\n");
    }
    client.write_all(&flood).unwrap();

    // A few replies may land in the socket buffers before out_buf crosses
    // the cap, but the stream must end well short of the full flood.
    let full_flood = 64 * (value.len() + 16);
    let mut received = 0usize;
    let mut buf = [0u8; 8192];
    loop {
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                received += n;
                assert!(received < full_flood, "server served the whole flood");
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                panic!("connection was never dropped");
            }
            Err(_) => break,
        }
    }

    server.shutdown();
}

#[test]
fn oversized_partial_frame_drops_the_connection() {
    let mut server = start_server_with_cap(64 * 1024);
    let mut client = connect(&server);

    // Announce a 1 MB bulk string and stream it without ever finishing the
    // frame. Nothing is parseable, so in_buf just grows until the cap.
    client.write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1000000\r\n").unwrap();
    let chunk = vec![b'x'; 8 * 1024];
    let mut severed_mid_write = false;
    for _ in 0..32 {
        if client.write_all(&chunk).is_err() {
            severed_mid_write = true;
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    if !severed_mid_write {
        let mut buf = [0u8; 16];
        match client.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => panic!("unexpected reply to an unfinished frame: {:?}", &buf[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                panic!("connection was never dropped");
            }
            Err(_) => {}
        }
    }

    server.shutdown();
}

#[test]
fn concurrent_sets_on_one_key_leave_one_of_the_values() {
    let mut server = start_server();
    let addr = server.local_addr();

    let mut handles = Vec::new();
    for i in 0..8 {
        handles.push(thread::spawn(move || {
            let mut client = TcpStream::connect(addr).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            let value = format!("writer{i}");
            let request = format!("*3\r\n$3\r\nSET\r\n$4\r\nrace\r\n${}\r\n{}\r\n", value.len(), value);
            client.write_all(request.as_bytes()).unwrap();
            let mut reply = [0u8; 5];
            client.read_exact(&mut reply).unwrap();
            assert_eq!(&reply, b"+OK\r\n");
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut client = connect(&server);
    client
        .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\nrace\r\n")
        .unwrap();
    let header = read_line(&mut client);
    assert_eq!(header, b"$7\r\n");
    let mut value = [0u8; 9];
    client.read_exact(&mut value).unwrap();
    let value = String::from_utf8_lossy(&value[..7]).into_owned();
    assert!(value.starts_with("writer"), "got {value:?}");

    server.shutdown();
}

#[test]
fn many_clients_in_parallel() {
    let mut server = start_server();
    let addr = server.local_addr();

    let mut handles = Vec::new();
    for t in 0..16 {
        handles.push(thread::spawn(move || {
            let mut client = TcpStream::connect(addr).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            for i in 0..20 {
                let key = format!("c{t}-{i}");
                let set = format!("*3\r\n$3\r\nSET\r\n${}\r\n{}\r\n$1\r\nx\r\n", key.len(), key);
                client.write_all(set.as_bytes()).unwrap();
                let mut ok = [0u8; 5];
                client.read_exact(&mut ok).unwrap();
                assert_eq!(&ok, b"+OK\r\n");

                let get = format!("*2\r\n$3\r\nGET\r\n${}\r\n{}\r\n", key.len(), key);
                client.write_all(get.as_bytes()).unwrap();
                let mut reply = [0u8; 7];
                client.read_exact(&mut reply).unwrap();
                assert_eq!(&reply, b"$1\r\nx\r\n");
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    server.shutdown();
}

#[test]
fn stats_reflect_served_traffic() {
    let mut server = start_server();
    let mut client = connect(&server);

    client
        .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\ns\r\n$1\r\nv\r\n")
        .unwrap();
    expect_reply(&mut client, b"+OK\r\n");
    client.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\ns\r\n").unwrap();
    expect_reply(&mut client, b"$1\r\nv\r\n");

    let stats = server.stats();
    assert!(stats.connections_accepted >= 1);
    assert!(stats.commands_processed >= 2);
    assert!(stats.bytes_read > 0);

    // The written-bytes counter is bumped after the reply hits the socket,
    // so give the write worker a moment to get there.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if server.stats().bytes_written > 0 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "bytes_written stayed 0");
        thread::sleep(Duration::from_millis(10));
    }

    server.shutdown();
}

#[test]
fn shutdown_closes_the_listener_and_live_connections() {
    let mut server = start_server();
    let addr = server.local_addr();
    let mut client = connect(&server);

    client
        .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
        .unwrap();
    expect_reply(&mut client, b"+OK\r\n");

    server.shutdown();

    // Existing connection is severed.
    let mut buf = [0u8; 8];
    match client.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected bytes after shutdown: {:?}", &buf[..n]),
    }

    // And nobody new gets in.
    assert!(TcpStream::connect(addr).is_err());
}
