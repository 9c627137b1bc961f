//! End-to-end tests over loopback TCP.
//!
//! Each test runs its own server on an ephemeral port, except the
//! walkthrough which uses the documented fixed port.

use sockconsole::{Client, ConsoleError, PromptOutcome, Server, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Poll `check` until it holds or the deadline passes.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn start_server() -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(ServerConfig::default()));
    let addr = server.listen("127.0.0.1:0").unwrap();
    (server, addr)
}

async fn connect(server: &Server, addr: SocketAddr) -> Client {
    let client = Client::connect("127.0.0.1", addr.port()).await.unwrap();
    let key = client.local_addr();
    assert!(eventually(|| server.get_keys().contains(&key)).await);
    client
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_console_walkthrough() {
    let server = Server::new(ServerConfig::default());
    let addr = server.listen("127.0.0.1:10111").unwrap();
    assert!(server.alive());

    let client = Client::connect("127.0.0.1", addr.port()).await.unwrap();
    let key = client.local_addr();
    assert!(eventually(|| server.get_keys() == vec![key]).await);

    let console = server.get_console(&key).unwrap();
    console.echo("hello from server").await.unwrap();
    assert_eq!(client.read().await.unwrap(), "hello from server");

    let outcome = console
        .prompt("say something", Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(outcome, PromptOutcome::TimedOut);
    // The timed-out question still reached the client
    assert_eq!(client.read().await.unwrap(), "say something");

    let asking = {
        let console = Arc::clone(&console);
        tokio::spawn(async move { console.prompt("say something", Duration::from_secs(5)).await })
    };
    assert_eq!(client.read().await.unwrap(), "say something");
    client.write("response").await.unwrap();
    assert_eq!(
        asking.await.unwrap().unwrap(),
        PromptOutcome::Reply("response".to_string())
    );
    assert!(!console.prompt_pending());

    client.close().await;
    assert!(!client.alive());
    assert!(eventually(|| !server.get_keys().contains(&key)).await);
    assert!(!console.is_alive());
    assert!(matches!(
        server.get_console(&key),
        Err(ConsoleError::NotFound(k)) if k == key
    ));

    server.close().await;
    assert!(!server.alive());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_clients_registered_and_removed() {
    const N: usize = 16;
    let (server, addr) = start_server().await;

    let mut clients = Vec::with_capacity(N);
    for _ in 0..N {
        clients.push(Client::connect("127.0.0.1", addr.port()).await.unwrap());
    }
    assert!(eventually(|| server.get_keys().len() == N).await);

    let mut keys = server.get_keys();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), N);
    for client in &clients {
        assert!(keys.contains(&client.local_addr()));
    }

    for client in &clients {
        client.close().await;
    }
    assert!(eventually(|| server.get_keys().is_empty()).await);
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_order_per_connection() {
    let (server, addr) = start_server().await;
    let a = connect(&server, addr).await;
    let b = connect(&server, addr).await;

    let console_a = server.get_console(&a.local_addr()).unwrap();
    let console_b = server.get_console(&b.local_addr()).unwrap();

    for i in 0..50 {
        console_a.echo(&format!("a-{i}")).await.unwrap();
        console_b.echo(&format!("b-{i}")).await.unwrap();
    }
    console_a.echo("multi\nline \\ text").await.unwrap();

    for i in 0..50 {
        assert_eq!(a.read().await.unwrap(), format!("a-{i}"));
    }
    for i in 0..50 {
        assert_eq!(b.read().await.unwrap(), format!("b-{i}"));
    }
    assert_eq!(a.read().await.unwrap(), "multi\nline \\ text");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_prompt_does_not_block_other_consoles() {
    let (server, addr) = start_server().await;
    let slow = connect(&server, addr).await;
    let fast = connect(&server, addr).await;

    let slow_console = server.get_console(&slow.local_addr()).unwrap();
    let waiting = tokio::spawn(async move {
        slow_console.prompt("take your time", Duration::from_secs(5)).await
    });

    let fast_console = server.get_console(&fast.local_addr()).unwrap();
    let answer = {
        let fast_console = Arc::clone(&fast_console);
        tokio::spawn(async move { fast_console.prompt("quick?", Duration::from_secs(5)).await })
    };
    assert_eq!(fast.read().await.unwrap(), "quick?");
    fast.write("yes").await.unwrap();
    assert_eq!(answer.await.unwrap().unwrap().reply().as_deref(), Some("yes"));

    // A new peer can still be accepted while the slow prompt waits
    let late = connect(&server, addr).await;
    assert!(server.get_keys().contains(&late.local_addr()));

    assert_eq!(slow.read().await.unwrap(), "take your time");
    slow.write("done").await.unwrap();
    assert_eq!(
        waiting.await.unwrap().unwrap(),
        PromptOutcome::Reply("done".to_string())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_prompt_rejected() {
    let (server, addr) = start_server().await;
    let client = connect(&server, addr).await;
    let console = server.get_console(&client.local_addr()).unwrap();

    let first = {
        let console = Arc::clone(&console);
        tokio::spawn(async move { console.prompt("first", Duration::from_secs(5)).await })
    };
    assert_eq!(client.read().await.unwrap(), "first");

    assert!(matches!(
        console.prompt("second", Duration::from_millis(10)).await,
        Err(ConsoleError::PromptInProgress(_))
    ));

    client.write("answer").await.unwrap();
    assert_eq!(first.await.unwrap().unwrap().reply().as_deref(), Some("answer"));

    // Marker is free again
    let outcome = console.prompt("third", Duration::from_millis(10)).await.unwrap();
    assert_eq!(outcome, PromptOutcome::TimedOut);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_close_releases_blocked_prompt() {
    let (server, addr) = start_server().await;
    let client = connect(&server, addr).await;
    let key = client.local_addr();
    let console = server.get_console(&key).unwrap();

    let waiting = {
        let console = Arc::clone(&console);
        tokio::spawn(async move { console.prompt("are you there?", Duration::from_secs(30)).await })
    };
    assert_eq!(client.read().await.unwrap(), "are you there?");
    client.close().await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("prompt hung after client close")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, PromptOutcome::Disconnected);
    assert!(eventually(|| server.get_console(&key).is_err()).await);
    assert!(matches!(console.echo("gone").await, Err(ConsoleError::ConnectionClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_close_releases_blocked_read() {
    let (server, addr) = start_server().await;
    let client = Arc::new(connect(&server, addr).await);

    let reading = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.read().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    server.close().await;

    let result = tokio::time::timeout(Duration::from_secs(2), reading)
        .await
        .expect("read hung after server close")
        .unwrap();
    assert!(matches!(result, Err(ConsoleError::ConnectionClosed)));
    assert!(eventually(|| !client.alive()).await);
    assert!(server.get_keys().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_peer_isolated() {
    use tokio::io::AsyncWriteExt;

    let (server, addr) = start_server().await;
    let good = connect(&server, addr).await;

    let mut bad = tokio::net::TcpStream::connect(addr).await.unwrap();
    let bad_key = bad.local_addr().unwrap();
    assert!(eventually(|| server.get_keys().contains(&bad_key)).await);

    bad.write_all(b"\xff\xfe\xfd\n").await.unwrap();
    assert!(eventually(|| !server.get_keys().contains(&bad_key)).await);

    let console = server.get_console(&good.local_addr()).unwrap();
    console.echo("still here").await.unwrap();
    assert_eq!(good.read().await.unwrap(), "still here");

    let again = connect(&server, addr).await;
    assert!(server.get_keys().contains(&again.local_addr()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_is_not_a_reply() {
    let (server, addr) = start_server().await;
    let client = connect(&server, addr).await;
    let console = server.get_console(&client.local_addr()).unwrap();

    assert!(client.heartbeat().await);
    let outcome = console.prompt("", Duration::from_millis(50)).await.unwrap();
    assert_eq!(outcome, PromptOutcome::TimedOut);
    assert!(console.is_alive());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_text_round_trips() {
    let (server, addr) = start_server().await;
    let client = connect(&server, addr).await;
    let console = server.get_console(&client.local_addr()).unwrap();

    console.echo("__HB__").await.unwrap();
    assert_eq!(
        client.read_timeout(Duration::from_secs(2)).await.unwrap().as_deref(),
        Some("__HB__")
    );

    let asking = {
        let console = Arc::clone(&console);
        tokio::spawn(async move { console.prompt("echo the marker", Duration::from_secs(5)).await })
    };
    assert_eq!(client.read().await.unwrap(), "echo the marker");
    assert!(client.heartbeat().await);
    client.write("__HB__").await.unwrap();
    assert_eq!(
        asking.await.unwrap().unwrap(),
        PromptOutcome::Reply("__HB__".to_string())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_closed_after_server_close() {
    let (server, addr) = start_server().await;
    let client = connect(&server, addr).await;

    server.close().await;
    tokio::time::timeout(Duration::from_secs(2), client.closed())
        .await
        .expect("client did not notice server close");
    assert!(!client.alive());
}

#[tokio::test]
async fn test_connect_without_server() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    assert!(matches!(
        Client::connect("127.0.0.1", port).await,
        Err(ConsoleError::Connection(_))
    ));
}
