use std::thread;
use teb::{EbClient, EbServer, Fabric, ImmData, Region, TransportError};

const TMO: u64 = 5_000;

fn prepared_pair(
    fabric: &Fabric,
    port: u16,
    num_buffers: usize,
    region_size: usize,
) -> (EbServer, EbClient, usize, usize) {
    let mut server = EbServer::new(0);
    server.initialize(fabric, "127.0.0.1", port, 1).expect("listen");

    let fabric2 = fabric.clone();
    let client_side = thread::spawn(move || {
        let mut client = EbClient::new(0);
        let li = client
            .connect(&fabric2, "127.0.0.1", port, TMO)
            .expect("connect");
        let source = Region::new(64).expect("source region");
        client
            .link_mut(li)
            .prepare_poster(7, &source, TMO)
            .expect("prepare poster");
        (client, li)
    });

    let si = server.connect_link(TMO).expect("accept");
    server
        .link_mut(si)
        .prepare_pender(1, region_size, num_buffers, TMO)
        .expect("prepare pender");
    let (client, li) = client_side.join().expect("client thread");

    (server, client, si, li)
}

#[test]
fn post_lands_bytes_and_immediate() {
    let fabric = Fabric::new();
    let (mut server, client, si, li) = prepared_pair(&fabric, 9000, 4, 256);

    for _ in 0..4 {
        server.link(si).post_comp_recv().expect("credit");
    }

    let payload = [0xaau8; 16];
    let imm = ImmData::value(ImmData::BUFFER | ImmData::RESPONSE, 7, 3);
    client.link(li).post(&payload, 32, imm).expect("post");

    let got = server.pend(TMO).expect("completion");
    assert_eq!(got, imm);
    assert_eq!(ImmData::src(got), 7);
    assert_eq!(ImmData::idx(got), 3);

    let bytes = server.link(si).local_region().expect("region").read(32, 16);
    assert_eq!(bytes, payload);

    // Peer ids were exchanged during prepare.
    assert_eq!(server.link(si).id(), 7);
    assert_eq!(client.link(li).id(), 1);
}

#[test]
fn posting_without_credit_fails_and_leaves_region_untouched() {
    let fabric = Fabric::new();
    let (server, client, si, li) = prepared_pair(&fabric, 9001, 2, 128);

    // No credits posted: the retry budget expires.
    let err = client
        .link(li)
        .post(&[1, 2, 3], 0, ImmData::value(ImmData::BUFFER, 7, 0))
        .expect_err("no credit");
    assert_eq!(err, TransportError::QueueFull);
    assert_eq!(
        server.link(si).local_region().expect("region").read(0, 3),
        vec![0, 0, 0]
    );
}

#[test]
fn out_of_region_posts_return_the_credit() {
    let fabric = Fabric::new();
    let (server, client, si, li) = prepared_pair(&fabric, 9002, 1, 16);

    server.link(si).post_comp_recv().expect("credit");
    let err = client
        .link(li)
        .post(&[0u8; 32], 0, ImmData::value(ImmData::BUFFER, 7, 0))
        .expect_err("oversized write");
    assert!(matches!(err, TransportError::OutOfRegion { .. }));

    // The credit came back, so a well-formed post still succeeds.
    client
        .link(li)
        .post(&[0u8; 8], 0, ImmData::value(ImmData::BUFFER, 7, 0))
        .expect("post after failed write");
}

#[test]
fn pend_switches_between_wait_and_poll_modes() {
    let fabric = Fabric::new();
    let (mut server, client, si, li) = prepared_pair(&fabric, 9003, 8, 128);
    for _ in 0..8 {
        server.link(si).post_comp_recv().expect("credit");
    }

    // Empty poll arms wait mode and returns immediately.
    let start = std::time::Instant::now();
    assert!(matches!(server.pend(200), Err(TransportError::Timeout(0))));
    assert!(start.elapsed().as_millis() < 100);

    // Armed wait observes a post made from another thread.
    let link = client.link(li);
    link.post(&[1u8; 4], 0, ImmData::value(ImmData::BUFFER, 7, 0))
        .expect("post");
    let got = server.pend(2_000).expect("waited completion");
    assert_eq!(ImmData::idx(got), 0);

    // A successful wait flips the server back to poll mode: the next
    // idle pend returns without blocking.
    let start = std::time::Instant::now();
    assert!(matches!(server.pend(2_000), Err(TransportError::Timeout(0))));
    assert!(start.elapsed().as_millis() < 100);
}

#[test]
fn check_eq_reports_disconnect_only_when_links_die() {
    let fabric = Fabric::new();
    let (mut server, mut client, _si, _li) = prepared_pair(&fabric, 9004, 1, 64);

    assert!(server.check_eq().is_ok());
    client.shutdown();
    assert_eq!(server.check_eq(), Err(TransportError::NotConnected));

    server.shutdown();
    assert_eq!(server.check_eq(), Err(TransportError::NotConnected));
}

#[test]
fn connect_times_out_without_a_listener() {
    let fabric = Fabric::new();
    let mut client = EbClient::new(0);
    let err = client
        .connect(&fabric, "127.0.0.1", 9005, 50)
        .expect_err("no listener");
    assert!(matches!(err, TransportError::NoListener(_)));
}
