// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end transport scenarios over real sockets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::{distributions::Alphanumeric, Rng};
use sip_core::{Response, SipMessage};
use sip_parse::parse_message;
use sip_transport::{
    IncomingRequest, SipEndpoint, SipHandler, SipTransport, TransportConfig,
};
use smol_str::SmolStr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

struct ForwardingHandler {
    requests: mpsc::UnboundedSender<IncomingRequest>,
}

#[async_trait]
impl SipHandler for ForwardingHandler {
    async fn on_request(&self, incoming: IncomingRequest) {
        let _ = self.requests.send(incoming);
    }

    async fn on_response(&self, _local: SipEndpoint, _remote: SipEndpoint, _response: Response) {}
}

fn options_bytes(seq: u32, branch: &str) -> Vec<u8> {
    format!(
        "OPTIONS sip:server.example SIP/2.0\r\n\
Via: SIP/2.0/TCP client.example:5060;branch={branch}\r\n\
From: <sip:raw@client.example>;tag=frag\r\n\
To: <sip:server@server.example>\r\n\
Call-ID: fragmentation@test\r\n\
CSeq: {seq} OPTIONS\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n"
    )
    .into_bytes()
}

/// Scenario: a raw TCP peer writes ten OPTIONS requests in 30 ms increments
/// over one connection; the transport must deliver exactly ten requests.
#[tokio::test]
async fn tcp_fragmentation_delivers_exactly_ten_requests() {
    let transport = SipTransport::new(TransportConfig::default());
    let endpoint = transport
        .add_tcp_channel("127.0.0.1:0".parse().unwrap())
        .await
        .expect("tcp channel");

    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.set_handler(Arc::new(ForwardingHandler { requests: tx }));

    let mut stream = TcpStream::connect(endpoint.addr).await.expect("connect");
    for seq in 1..=10u32 {
        let branch = format!("z9hG4bKfrag{seq:04}");
        stream
            .write_all(&options_bytes(seq, &branch))
            .await
            .expect("write");
        sleep(Duration::from_millis(30)).await;
    }
    stream.shutdown().await.expect("clean close");

    let mut seen = Vec::new();
    for _ in 0..10 {
        let incoming = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timely delivery")
            .expect("request");
        seen.push(incoming.request.header.cseq.clone().unwrap().seq);
    }
    seen.sort_unstable();
    assert_eq!(seen, (1..=10).collect::<Vec<u32>>());

    // No merges, no duplicates: nothing else arrives.
    assert!(
        timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
        "more than ten requests delivered"
    );

    transport.shutdown().await;
}

/// Scenario: a STUN binding request on the SIP socket must bypass the SIP
/// pipeline and fire the STUN hook with the right endpoints and length.
#[tokio::test]
async fn stun_demultiplexes_off_the_sip_pipeline() {
    let transport = SipTransport::new(TransportConfig::default());
    let endpoint = transport
        .add_udp_channel("127.0.0.1:0".parse().unwrap())
        .await
        .expect("udp channel");

    let (req_tx, mut req_rx) = mpsc::unbounded_channel();
    transport.set_handler(Arc::new(ForwardingHandler { requests: req_tx }));

    let (stun_tx, mut stun_rx) = mpsc::unbounded_channel();
    transport.set_stun_hook(Arc::new(move |local, remote, payload: Bytes| {
        let _ = stun_tx.send((local, remote, payload.len()));
    }));

    let stun_message =
        sip_stun::StunMessage::new(sip_stun::MessageClass::Request, sip_stun::METHOD_BINDING)
            .encode();
    assert!(stun_message[0] == 0x00 || stun_message[0] == 0x01);

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&stun_message, endpoint.addr)
        .await
        .expect("send stun");

    let (local, remote, len) = timeout(Duration::from_secs(1), stun_rx.recv())
        .await
        .expect("hook fired")
        .expect("stun event");
    assert_eq!(local.addr, endpoint.addr);
    assert_eq!(remote.addr, socket.local_addr().unwrap());
    assert_eq!(len, stun_message.len());

    // The SIP pipeline saw nothing.
    assert!(timeout(Duration::from_millis(200), req_rx.recv())
        .await
        .is_err());

    transport.shutdown().await;
}

/// Scenario: route preprocessing fixes up strict-router artifacts before
/// the request reaches the application.
#[tokio::test]
async fn strict_router_request_uri_is_restored() {
    let config = TransportConfig {
        local_domains: vec![SmolStr::new("proxy.example")],
        ..TransportConfig::default()
    };
    let transport = SipTransport::new(config);
    let endpoint = transport
        .add_udp_channel("127.0.0.1:0".parse().unwrap())
        .await
        .expect("udp channel");

    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.set_handler(Arc::new(ForwardingHandler { requests: tx }));

    let raw = b"INVITE sip:proxy.example;lr SIP/2.0\r\n\
Via: SIP/2.0/UDP client.example:5060;branch=z9hG4bKstrictswap\r\n\
From: <sip:alice@client.example>;tag=42\r\n\
To: <sip:bob@b.example>\r\n\
Call-ID: strict@test\r\n\
CSeq: 1 INVITE\r\n\
Max-Forwards: 70\r\n\
Route: <sip:a.example;lr>\r\n\
Route: <sip:b.example;lr>\r\n\
Content-Length: 0\r\n\r\n";

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(raw, endpoint.addr).await.expect("send");

    let incoming = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timely")
        .expect("request");
    // The bottom Route was popped back into the Request-URI...
    assert_eq!(incoming.request.uri.host.as_str(), "b.example");
    // ...and only the untouched entry remains.
    let hosts: Vec<&str> = incoming
        .request
        .header
        .routes
        .iter()
        .map(|r| r.uri.host.as_str())
        .collect();
    assert_eq!(hosts, vec!["a.example"]);

    transport.shutdown().await;
}

/// Scenario: an oversized datagram is answered with 413.
#[tokio::test]
async fn oversized_message_gets_413() {
    let config = TransportConfig {
        max_receive_length: 512,
        ..TransportConfig::default()
    };
    let transport = SipTransport::new(config);
    let endpoint = transport
        .add_udp_channel("127.0.0.1:0".parse().unwrap())
        .await
        .expect("udp channel");

    let raw = format!(
        "MESSAGE sip:server.example SIP/2.0\r\n\
Via: SIP/2.0/UDP client.example;branch=z9hG4bKbig\r\n\
From: <sip:a@client.example>;tag=1\r\n\
To: <sip:b@server.example>\r\n\
Call-ID: big@test\r\n\
CSeq: 1 MESSAGE\r\n\
X-Padding: {}\r\n\
Content-Length: 0\r\n\r\n",
        "P".repeat(600)
    )
    .into_bytes();
    assert!(raw.len() > 512);

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&raw, endpoint.addr).await.expect("send");

    let mut buf = vec![0u8; 2048];
    let (n, _) = timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
        .await
        .expect("413 reply")
        .expect("recv");
    let SipMessage::Response(resp) = parse_message(&buf[..n]).expect("parse 413") else {
        panic!("expected response");
    };
    assert_eq!(resp.status, 413);

    transport.shutdown().await;
}

/// Scenario: WebSocket round trip with 1000-char headers; the trailing
/// marker headers prove full reassembly of fragmented frames.
#[cfg(feature = "ws")]
#[tokio::test]
async fn websocket_large_headers_round_trip() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::{
        self, client::IntoClientRequest, http::header::HeaderValue,
    };

    struct EchoHandler;

    #[async_trait]
    impl SipHandler for EchoHandler {
        async fn on_request(&self, incoming: IncomingRequest) {
            assert_eq!(
                incoming
                    .request
                    .header
                    .get_unknown("X-Request-Final")
                    .map(|v| v.as_str()),
                Some("TheEnd"),
                "request marker lost in transit"
            );
            let random: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(1000)
                .map(char::from)
                .collect();
            let mut response =
                Response::for_request(200, "OK", &incoming.request);
            response.header.push_unknown("X-Response-Random", random);
            response.header.push_unknown("X-Response-Final", "TheEnd");
            if let Some(txn) = incoming.transaction {
                txn.send_final(response).await;
            }
        }

        async fn on_response(
            &self,
            _local: SipEndpoint,
            _remote: SipEndpoint,
            _response: Response,
        ) {
        }
    }

    let transport = SipTransport::new(TransportConfig::default());
    let endpoint = transport
        .add_ws_channel("127.0.0.1:0".parse().unwrap())
        .await
        .expect("ws channel");
    transport.set_handler(Arc::new(EchoHandler));

    let mut request = format!("ws://{}/", endpoint.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("sip"));
    let (mut client, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");

    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(1000)
        .map(char::from)
        .collect();
    let options = format!(
        "OPTIONS sip:server.example SIP/2.0\r\n\
Via: SIP/2.0/WS client.invalid;branch=z9hG4bKwsround\r\n\
From: <sip:caller@client.invalid>;tag=ws1\r\n\
To: <sip:server@server.example>\r\n\
Call-ID: ws-roundtrip@test\r\n\
CSeq: 1 OPTIONS\r\n\
Max-Forwards: 70\r\n\
X-Request-Random: {random}\r\n\
X-Request-Final: TheEnd\r\n\
Content-Length: 0\r\n\r\n"
    );
    client
        .send(tungstenite::Message::Text(options))
        .await
        .expect("send options");

    let reply = timeout(Duration::from_secs(2), client.next())
        .await
        .expect("timely reply")
        .expect("frame")
        .expect("ws message");
    let payload = match reply {
        tungstenite::Message::Text(text) => text.into_bytes(),
        tungstenite::Message::Binary(data) => data,
        other => panic!("unexpected frame {other:?}"),
    };
    let SipMessage::Response(response) = parse_message(&payload).expect("parse response") else {
        panic!("expected response");
    };
    assert_eq!(response.status, 200);
    assert_eq!(
        response
            .header
            .get_unknown("X-Response-Random")
            .map(|v| v.len()),
        Some(1000)
    );
    assert_eq!(
        response
            .header
            .get_unknown("X-Response-Final")
            .map(|v| v.as_str()),
        Some("TheEnd")
    );

    transport.shutdown().await;
}
