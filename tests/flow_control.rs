use smux::{ConfigBuilder, Session, SmuxError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

mod common;

async fn session_pair(config: smux::Config) -> (Session, Session) {
    common::init_tracing();
    let (client_transport, server_transport) = tokio::io::duplex(8192);

    let client_session = Session::client(client_transport, config.clone())
        .await
        .unwrap();
    let server_session = Session::server(server_transport, config).await.unwrap();
    (client_session, server_session)
}

#[tokio::test]
async fn test_session_flow_control() {
    // Create a small buffer size to trigger flow control
    let config = ConfigBuilder::new()
        .max_frame_size(100)
        .max_receive_buffer(512)
        .max_stream_buffer(512)
        .build()
        .unwrap();
    let (client_session, server_session) = session_pair(config).await;

    let client_stream = client_session.open_stream().await.unwrap();
    let server_stream = server_session.accept_stream().await.unwrap();

    // More than the receive budget; the writer is not blocked by it.
    let test_data = vec![42u8; 2048];
    client_stream.write(&test_data).await.unwrap();
    client_stream.close_write().await.unwrap();

    let mut total_read = 0;
    let mut buffer = [0u8; 100];
    loop {
        match server_stream.read(&mut buffer).await {
            Ok(n) => {
                assert!(buffer[..n].iter().all(|&byte| byte == 42));
                total_read += n;
            }
            Err(SmuxError::Eof) => break,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }

    assert_eq!(total_read, test_data.len());
}

#[tokio::test]
async fn test_token_exhaustion_and_recovery() {
    let config = ConfigBuilder::new()
        .max_frame_size(100)
        .max_receive_buffer(200)
        .max_stream_buffer(200)
        .build()
        .unwrap();
    let (client_session, server_session) = session_pair(config).await;

    let mut client_streams = Vec::new();
    let mut server_streams = Vec::new();
    for _ in 0..3 {
        client_streams.push(client_session.open_stream().await.unwrap());
        server_streams.push(server_session.accept_stream().await.unwrap());
    }

    let bytes_sent = Arc::new(AtomicUsize::new(0));
    let bytes_received = Arc::new(AtomicUsize::new(0));

    let mut write_handles = Vec::new();
    for (i, stream) in client_streams.into_iter().enumerate() {
        let bytes_sent = Arc::clone(&bytes_sent);
        write_handles.push(tokio::spawn(async move {
            let data = vec![i as u8; 2000];
            let n = stream.write(&data).await.unwrap();
            bytes_sent.fetch_add(n, Ordering::Relaxed);
            stream.close_write().await.unwrap();
            stream
        }));
    }

    let mut read_handles = Vec::new();
    for stream in server_streams {
        let bytes_received = Arc::clone(&bytes_received);
        read_handles.push(tokio::spawn(async move {
            let mut buffer = [0u8; 100];
            let expected = (stream.stream_id() / 2 - 1) as u8;
            loop {
                match stream.read(&mut buffer).await {
                    Ok(n) => {
                        assert!(buffer[..n].iter().all(|&byte| byte == expected));
                        bytes_received.fetch_add(n, Ordering::Relaxed);
                        // Slow consumer keeps the budget exhausted
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    Err(SmuxError::Eof) => break,
                    Err(e) => panic!("unexpected read error: {e}"),
                }
            }
        }));
    }

    let mut writers = Vec::new();
    for handle in write_handles {
        writers.push(handle.await.unwrap());
    }
    for handle in read_handles {
        handle.await.unwrap();
    }

    assert_eq!(bytes_sent.load(Ordering::Relaxed), 6000);
    assert_eq!(bytes_received.load(Ordering::Relaxed), 6000);
}

#[tokio::test]
async fn test_slow_stream_does_not_stall_others_v2() {
    let config = ConfigBuilder::new().version(2).build().unwrap();
    let (client_session, server_session) = session_pair(config).await;

    let stalled = Arc::new(client_session.open_stream().await.unwrap());
    let _never_read = server_session.accept_stream().await.unwrap();
    let busy = client_session.open_stream().await.unwrap();
    let busy_peer = server_session.accept_stream().await.unwrap();

    // Fills the stalled stream's window and then waits for an update
    // that never comes.
    let stalled_writer = {
        let stalled = Arc::clone(&stalled);
        tokio::spawn(async move { stalled.write(&vec![1u8; 1024 * 1024]).await })
    };

    let payload = vec![2u8; 512 * 1024];
    let reader = tokio::spawn(async move {
        let mut buffer = vec![0u8; 16 * 1024];
        let mut total = 0;
        loop {
            match busy_peer.read(&mut buffer).await {
                Ok(n) => total += n,
                Err(SmuxError::Eof) => break total,
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
    });

    let written = tokio::time::timeout(Duration::from_secs(10), busy.write(&payload))
        .await
        .expect("busy stream stalled behind a full window")
        .unwrap();
    busy.close_write().await.unwrap();
    assert_eq!(written, payload.len());
    assert_eq!(reader.await.unwrap(), payload.len());

    assert!(!stalled_writer.is_finished());
    stalled.close().await.unwrap();
    assert!(matches!(
        stalled_writer.await.unwrap(),
        Err(SmuxError::ClosedPipe)
    ));
}

#[tokio::test]
async fn test_write_timeout_on_full_window() {
    let config = ConfigBuilder::new().version(2).build().unwrap();
    let (client_session, server_session) = session_pair(config).await;

    let stream = client_session.open_stream().await.unwrap();
    let _peer = server_session.accept_stream().await.unwrap();
    stream.set_write_timeout(Some(Duration::from_millis(100)));

    let err = stream.write(&vec![0u8; 1024 * 1024]).await.unwrap_err();
    assert!(matches!(err, SmuxError::WriteTimeout));
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn test_peer_close_ends_window_wait() {
    let config = ConfigBuilder::new().version(2).build().unwrap();
    let (client_session, server_session) = session_pair(config).await;

    let stream = client_session.open_stream().await.unwrap();
    let peer = server_session.accept_stream().await.unwrap();

    // No write timeout: only the peer's FIN can end the wait.
    let writer = tokio::spawn(async move { stream.write(&vec![5u8; 1024 * 1024]).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!writer.is_finished());
    peer.close().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), writer)
        .await
        .expect("writer still blocked after the peer closed")
        .unwrap();
    assert!(matches!(result, Err(SmuxError::Eof)));
    assert!(!client_session.is_closed());
}

#[tokio::test]
async fn test_window_update_resumes_writer() {
    let config = ConfigBuilder::new()
        .version(2)
        .max_frame_size(1024)
        .max_stream_buffer(4096)
        .build()
        .unwrap();
    let (client_session, server_session) = session_pair(config).await;

    let stream = client_session.open_stream().await.unwrap();
    let peer = server_session.accept_stream().await.unwrap();

    let len = 600 * 1024;
    let writer = tokio::spawn(async move {
        let n = stream.write(&vec![9u8; len]).await.unwrap();
        stream.close_write().await.unwrap();
        n
    });

    let mut buffer = [0u8; 1000];
    let mut total = 0;
    loop {
        match peer.read(&mut buffer).await {
            Ok(n) => {
                assert!(buffer[..n].iter().all(|&byte| byte == 9));
                total += n;
            }
            Err(SmuxError::Eof) => break,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }

    assert_eq!(total, len);
    assert_eq!(writer.await.unwrap(), len);
}
