//! End-to-end tests: a real server on an ephemeral port, driven by the
//! `redis` client and, where exact bytes matter, by a raw socket.

use redis::{Commands, Connection, RedisResult, Value};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use xdis::{MemoryStorage, Server, Service, ServiceOptions};

/// Starts a server on its own runtime thread and returns its address.
fn start_server(opts: ServiceOptions) -> SocketAddr {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let storage = Arc::new(MemoryStorage::new(16, 1024));
            let service = Arc::new(Service::new(storage, opts));
            let server = Server::bind(service, "127.0.0.1:0").await.unwrap();
            tx.send(server.local_addr().unwrap()).unwrap();
            server.run().await.unwrap();
        });
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

fn connect(addr: SocketAddr) -> Connection {
    redis::Client::open(format!("redis://{}/", addr))
        .unwrap()
        .get_connection()
        .unwrap()
}

/// Raw socket with a read timeout, for byte-exact checks.
fn raw(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
}

/// Reads until `expected.len()` bytes arrived and compares them.
fn expect_bytes(stream: &mut TcpStream, expected: &str) {
    let mut buf = vec![0u8; expected.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(String::from_utf8_lossy(&buf), expected);
}

#[test]
fn test_basic_string_and_hash() {
    let addr = start_server(ServiceOptions::default());
    let mut con = connect(addr);

    let _: () = con.set("k", "v").unwrap();
    let v: String = con.get("k").unwrap();
    assert_eq!(v, "v");
    let n: i64 = con.incr("counter", 5).unwrap();
    assert_eq!(n, 5);

    let _: () = con.hset("h", "f", "1").unwrap();
    let all: Vec<(String, String)> = con.hgetall("h").unwrap();
    assert_eq!(all, vec![("f".to_string(), "1".to_string())]);

    let err = con.lpush::<_, _, i64>("k", "x").unwrap_err();
    assert_eq!(err.code(), Some("WRONGTYPE"));
}

#[test]
fn test_rpoplpush_same_key_keeps_ttl() {
    let addr = start_server(ServiceOptions::default());
    let mut con = connect(addr);

    let _: i64 = con.rpush("l", &["a", "b"]).unwrap();
    let _: bool = con.expire("l", 100).unwrap();
    let moved: String = con.rpoplpush("l", "l").unwrap();
    assert_eq!(moved, "b");

    let items: Vec<String> = con.lrange("l", 0, -1).unwrap();
    assert_eq!(items, vec!["b", "a"]);
    let ttl: i64 = con.ttl("l").unwrap();
    assert!(ttl > 0 && ttl <= 100, "ttl {}", ttl);
}

#[test]
fn test_blpop_times_out() {
    let addr = start_server(ServiceOptions::default());
    let mut con = connect(addr);

    let start = Instant::now();
    let popped: Option<(String, String)> = redis::cmd("BLPOP")
        .arg("nothing")
        .arg("0.2")
        .query(&mut con)
        .unwrap();
    assert_eq!(popped, None);
    assert!(start.elapsed() >= Duration::from_millis(200));

    // The connection is still usable afterwards.
    let pong: String = redis::cmd("PING").query(&mut con).unwrap();
    assert_eq!(pong, "PONG");
}

#[test]
fn test_blpop_woken_by_push() {
    let addr = start_server(ServiceOptions::default());
    let mut waiter = connect(addr);
    let mut pusher = connect(addr);

    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        let _: i64 = pusher.rpush("jobs", "j1").unwrap();
    });
    let popped: Option<(String, String)> = redis::cmd("BLPOP")
        .arg("jobs")
        .arg("5")
        .query(&mut waiter)
        .unwrap();
    handle.join().unwrap();
    assert_eq!(popped, Some(("jobs".to_string(), "j1".to_string())));
}

#[test]
fn test_errors_on_the_wire() {
    let addr = start_server(ServiceOptions::default());
    let mut stream = raw(addr);

    stream.write_all(b"*1\r\n$6\r\nNOSUCH\r\n").unwrap();
    expect_bytes(&mut stream, "-ERR unknown command 'NOSUCH'\r\n");

    stream.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\n").unwrap();
    stream.write_all(b"k\r\n").unwrap();
    expect_bytes(&mut stream, "$-1\r\n");

    stream.write_all(b"*1\r\n$3\r\nGET\r\n").unwrap();
    expect_bytes(
        &mut stream,
        "-ERR wrong number of arguments for 'get' command\r\n",
    );

    stream.write_all(b"*2\r\n$5\r\nHELLO\r\n$1\r\n4\r\n").unwrap();
    expect_bytes(&mut stream, "-NOPROTO unsupported protocol version\r\n");

    stream.write_all(b"*1\r\n$4\r\nQUIT\r\n").unwrap();
    expect_bytes(&mut stream, "+OK\r\n");
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
}

#[test]
fn test_pipelined_replies_keep_order() {
    let addr = start_server(ServiceOptions::default());
    let mut stream = raw(addr);
    stream
        .write_all(b"SET a 1\r\nINCR a\r\nGET a\r\nPING\r\n")
        .unwrap();
    expect_bytes(&mut stream, "+OK\r\n:2\r\n$1\r\n2\r\n+PONG\r\n");
}

#[test]
fn test_auth_flow() {
    let opts = ServiceOptions {
        auth_password: Some("secret".to_string()),
        ..ServiceOptions::default()
    };
    let addr = start_server(opts);
    let mut con = connect(addr);

    let err = con.get::<_, Option<String>>("k").unwrap_err();
    assert_eq!(err.code(), Some("NOAUTH"));
    let pong: String = redis::cmd("PING").query(&mut con).unwrap();
    assert_eq!(pong, "PONG");

    let err: RedisResult<()> = redis::cmd("AUTH").arg("wrong").query(&mut con);
    assert!(err.unwrap_err().to_string().contains("invalid password"));
    let _: () = redis::cmd("AUTH").arg("secret").query(&mut con).unwrap();
    let v: Option<String> = con.get("k").unwrap();
    assert_eq!(v, None);
}

#[test]
fn test_hello_reports_server() {
    let addr = start_server(ServiceOptions::default());
    let mut con = connect(addr);
    let reply: Value = redis::cmd("HELLO")
        .arg(3)
        .arg("SETNAME")
        .arg("worker")
        .query(&mut con)
        .unwrap();
    match reply {
        Value::Bulk(items) => assert_eq!(items.len(), 8),
        other => panic!("unexpected HELLO reply {:?}", other),
    }
    let name: Option<String> = redis::cmd("CLIENT").arg("GETNAME").query(&mut con).unwrap();
    assert_eq!(name.as_deref(), Some("worker"));
}

#[test]
fn test_publish_subscribe() {
    let addr = start_server(ServiceOptions::default());
    let mut sub = raw(addr);
    sub.write_all(b"SUBSCRIBE news\r\n").unwrap();
    expect_bytes(&mut sub, "*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n");
    sub.write_all(b"PSUBSCRIBE n*\r\n").unwrap();
    expect_bytes(&mut sub, "*3\r\n$10\r\npsubscribe\r\n$2\r\nn*\r\n:2\r\n");

    let mut con = connect(addr);
    let receivers: i64 = con.publish("news", "hello").unwrap();
    assert_eq!(receivers, 2);

    // Exact and pattern deliveries may arrive in either order.
    let message = "*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n";
    let pmessage = "*4\r\n$8\r\npmessage\r\n$2\r\nn*\r\n$4\r\nnews\r\n$5\r\nhello\r\n";
    let mut buf = vec![0u8; message.len() + pmessage.len()];
    sub.read_exact(&mut buf).unwrap();
    let got = String::from_utf8_lossy(&buf).to_string();
    assert!(
        got == format!("{}{}", message, pmessage) || got == format!("{}{}", pmessage, message),
        "{:?}",
        got
    );

    sub.write_all(b"GET k\r\n").unwrap();
    let mut line = [0u8; 16];
    sub.read_exact(&mut line).unwrap();
    assert_eq!(&line, b"-ERR Can't execu");
}

/// Polls `INFO clients` until `connected_clients` equals `want`.
fn wait_for_clients(con: &mut Connection, want: usize) -> String {
    let needle = format!("connected_clients:{}\r\n", want);
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let info: String = redis::cmd("INFO").arg("clients").query(con).unwrap();
        if info.contains(&needle) || Instant::now() > deadline {
            return info;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_subscriber_leaving_during_publish() {
    let addr = start_server(ServiceOptions::default());
    let mut sub = raw(addr);
    sub.write_all(b"SUBSCRIBE feed\r\n").unwrap();
    expect_bytes(&mut sub, "*3\r\n$9\r\nsubscribe\r\n$4\r\nfeed\r\n:1\r\n");

    let stop = Arc::new(AtomicBool::new(false));
    let publisher = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut con = connect(addr);
            let mut sent = 0;
            while !stop.load(Ordering::Relaxed) {
                let _: i64 = con.publish("feed", "tick").unwrap();
                sent += 1;
            }
            sent
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    drop(sub);
    std::thread::sleep(Duration::from_millis(100));
    stop.store(true, Ordering::Relaxed);
    assert!(publisher.join().unwrap() > 0);

    let mut con = connect(addr);
    let info = wait_for_clients(&mut con, 1);
    assert!(info.contains("connected_clients:1\r\n"), "{}", info);
    let receivers: i64 = con.publish("feed", "after").unwrap();
    assert_eq!(receivers, 0);
}

#[test]
fn test_slot_migration_between_servers() {
    let source = start_server(ServiceOptions::default());
    let target = start_server(ServiceOptions::default());
    let mut src = connect(source);
    let mut dst = connect(target);

    let _: () = src.set("{user}name", "ann").unwrap();
    let _: () = src.set_ex("{user}session", "s1", 100).unwrap();
    let _: i64 = src.sadd("{user}tags", &["a", "b"]).unwrap();

    let moved: i64 = redis::cmd("SLOTSMGRTTAGONE")
        .arg(target.ip().to_string())
        .arg(target.port())
        .arg(1000)
        .arg("{user}name")
        .query(&mut src)
        .unwrap();
    assert_eq!(moved, 3);

    let exists: i64 = src.exists("{user}name").unwrap();
    assert_eq!(exists, 0);
    let name: String = dst.get("{user}name").unwrap();
    assert_eq!(name, "ann");
    let ttl: i64 = dst.ttl("{user}session").unwrap();
    assert!(ttl > 0 && ttl <= 100, "ttl {}", ttl);
    let tags: i64 = dst.scard("{user}tags").unwrap();
    assert_eq!(tags, 2);

    // Nothing left to move.
    let moved: i64 = redis::cmd("SLOTSMGRTONE")
        .arg(target.ip().to_string())
        .arg(target.port())
        .arg(1000)
        .arg("{user}name")
        .query(&mut src)
        .unwrap();
    assert_eq!(moved, 0);
}

#[test]
fn test_idle_connection_is_closed() {
    let opts = ServiceOptions {
        conn_keepalive_interval: Duration::from_secs(1),
        ..ServiceOptions::default()
    };
    let addr = start_server(opts);
    let mut stream = raw(addr);
    stream.write_all(b"PING\r\n").unwrap();
    expect_bytes(&mut stream, "+PONG\r\n");

    let start = Instant::now();
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
    assert!(start.elapsed() >= Duration::from_millis(900));
}
