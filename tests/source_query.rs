use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bzip2::write::BzEncoder;
use bzip2::Compression;
use rstest::rstest;
use tokio::net::UdpSocket;

use rgamequery::packet::PacketType;
use rgamequery::source::{self, Query, SourceDecoder, SourceRequest, SourceResponse};
use rgamequery::split::AssemblerKind;
use rgamequery::transport::UdpTransport;
use rgamequery::{Messenger, MessengerConfig, QueryError, Response};

const SINGLE: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

struct Client {
    messenger: Arc<Messenger<SourceRequest, SourceResponse>>,
}

impl Client {
    async fn start(kind: AssemblerKind, read_timeout: Duration) -> Client {
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0").await.unwrap());
        let config = MessengerConfig::new().with_read_timeout(Some(read_timeout));
        let messenger: Messenger<SourceRequest, SourceResponse> =
            Messenger::new(transport.clone(), source::directory(), config).unwrap();
        let messenger = Arc::new(messenger);
        let decoder = SourceDecoder::new(kind, transport.local_addr().unwrap())
            .with_group_timeout(read_timeout);
        transport.spawn_receiver(messenger.clone(), decoder);
        Client { messenger }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.messenger.close();
    }
}

async fn fake_server() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 1400];
    let (len, from) = socket.recv_from(&mut buf).await.unwrap();
    (buf[..len].to_vec(), from)
}

fn split(id: i32, total: u8, number: u8, max_size: u16, head: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut raw = vec![0xfe, 0xff, 0xff, 0xff];
    raw.extend_from_slice(&id.to_le_bytes());
    raw.extend_from_slice(&[total, number]);
    raw.extend_from_slice(&max_size.to_le_bytes());
    raw.extend_from_slice(head);
    raw.extend_from_slice(payload);
    raw
}

fn info_body() -> Vec<u8> {
    let mut body = vec![17];
    body.extend_from_slice(b"test server\0cp_badlands\0tf\0Team Fortress\0");
    body.extend_from_slice(&[0xb8, 0x01, 3, 24, 0, b'd', b'l', 0, 1]);
    body
}

#[rstest]
#[tokio::test]
async fn split_info_response_resolves_query(
    #[values(AssemblerKind::Eager, AssemblerKind::Lazy)] kind: AssemblerKind,
) {
    let client = Client::start(kind, Duration::from_secs(5)).await;
    let (server, addr) = fake_server().await;

    let server_task = tokio::spawn(async move {
        let (request, from) = recv(&server).await;
        assert_eq!(&request[..5], &[0xff, 0xff, 0xff, 0xff, 0x54]);

        let mut whole = SINGLE.to_vec();
        whole.push(0x49);
        whole.extend_from_slice(&info_body());
        let chunks: Vec<_> = whole.chunks(16).collect();
        let total = chunks.len() as u8;
        for number in (0..total).rev() {
            let datagram = split(99, total, number, 16, &[], chunks[number as usize]);
            server.send_to(&datagram, from).await.unwrap();
        }
    });

    let response = client
        .messenger
        .query(SourceRequest::info(addr))
        .await
        .unwrap();
    assert_eq!(response.packet_type(), PacketType::InfoResponse);
    assert_eq!(response.sender(), addr);
    assert_eq!(response.body(), info_body().as_slice());
    assert_eq!(client.messenger.pending(), 0);
    server_task.await.unwrap();
}

#[tokio::test]
async fn challenged_info_query_is_repeated_with_challenge() {
    let client = Client::start(AssemblerKind::Lazy, Duration::from_secs(5)).await;
    let (server, addr) = fake_server().await;

    let server_task = tokio::spawn(async move {
        let (request, from) = recv(&server).await;
        assert_eq!(&request[..5], &[0xff, 0xff, 0xff, 0xff, 0x54]);
        assert!(request.ends_with(b"Source Engine Query\0"));
        server
            .send_to(&[0xff, 0xff, 0xff, 0xff, 0x41, 1, 2, 3, 4], from)
            .await
            .unwrap();

        let (request, from) = recv(&server).await;
        assert_eq!(&request[..5], &[0xff, 0xff, 0xff, 0xff, 0x54]);
        assert!(request.ends_with(&[1, 2, 3, 4]));
        let mut info = SINGLE.to_vec();
        info.push(0x49);
        info.extend_from_slice(&info_body());
        server.send_to(&info, from).await.unwrap();
    });

    let response = source::query(&client.messenger, Query::Info, addr)
        .await
        .unwrap();
    assert_eq!(response.packet_type(), PacketType::InfoResponse);
    assert_eq!(response.body(), info_body().as_slice());
    assert_eq!(client.messenger.pending(), 0);
    server_task.await.unwrap();
}

#[tokio::test]
async fn players_query_obtains_challenge_first() {
    let client = Client::start(AssemblerKind::Lazy, Duration::from_secs(5)).await;
    let (server, addr) = fake_server().await;

    let server_task = tokio::spawn(async move {
        let (request, from) = recv(&server).await;
        assert_eq!(request, [0xff, 0xff, 0xff, 0xff, 0x55, 0xff, 0xff, 0xff, 0xff]);
        let mut challenge = SINGLE.to_vec();
        challenge.push(0x41);
        challenge.extend_from_slice(&0x1234_5678i32.to_le_bytes());
        server.send_to(&challenge, from).await.unwrap();

        let (request, from) = recv(&server).await;
        assert_eq!(&request[5..], &0x1234_5678i32.to_le_bytes());
        let mut players = SINGLE.to_vec();
        players.extend_from_slice(&[0x44, 1, 0]);
        players.extend_from_slice(b"player\0");
        server.send_to(&players, from).await.unwrap();
    });

    let response = source::query(&client.messenger, Query::Players, addr)
        .await
        .unwrap();
    assert_eq!(response.packet_type(), PacketType::PlayersResponse);
    assert_eq!(&response.body()[..2], &[1, 0]);
    server_task.await.unwrap();
}

#[tokio::test]
async fn compressed_rules_response_is_decompressed() {
    let client = Client::start(AssemblerKind::Lazy, Duration::from_secs(5)).await;
    let (server, addr) = fake_server().await;

    let mut whole = SINGLE.to_vec();
    whole.push(0x45);
    for n in 0..200u16 {
        whole.extend_from_slice(format!("rule_{n}\0value_{n}\0").as_bytes());
    }
    let expected_body = whole[5..].to_vec();

    let server_task = tokio::spawn(async move {
        let (_challenge_request, from) = recv(&server).await;
        let mut challenge = SINGLE.to_vec();
        challenge.push(0x41);
        challenge.extend_from_slice(&7i32.to_le_bytes());
        server.send_to(&challenge, from).await.unwrap();

        let (_rules_request, from) = recv(&server).await;
        let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&whole).unwrap();
        let packed = encoder.finish().unwrap();

        let id = (0x8000_0000u32 | 3) as i32;
        let chunks: Vec<_> = packed.chunks(256).collect();
        let total = chunks.len() as u8;
        for (number, chunk) in chunks.iter().enumerate() {
            let head = if number == 0 {
                let mut head = (whole.len() as u32).to_le_bytes().to_vec();
                head.extend_from_slice(&crc32fast::hash(&whole).to_le_bytes());
                head
            } else {
                Vec::new()
            };
            let datagram = split(id, total, number as u8, 256, &head, chunk);
            server.send_to(&datagram, from).await.unwrap();
        }
    });

    let response = source::query(&client.messenger, Query::Rules, addr)
        .await
        .unwrap();
    assert_eq!(response.packet_type(), PacketType::RulesResponse);
    assert_eq!(response.body(), expected_body.as_slice());
    server_task.await.unwrap();
}

#[tokio::test]
async fn silent_server_times_out() {
    let client = Client::start(AssemblerKind::Lazy, Duration::from_millis(200)).await;
    let (_server, addr) = fake_server().await;

    let started = tokio::time::Instant::now();
    let result = client
        .messenger
        .query(SourceRequest::info(addr))
        .await;
    match result {
        Err(QueryError::ReadTimeout { key, .. }) => assert_eq!(key.peer(), addr),
        other => panic!("expected ReadTimeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(client.messenger.pending(), 0);
}
