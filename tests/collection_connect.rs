use serde_json::json;
use teb::{
    drp_port, mrq_port, parse_connection_params, teb_port, EbParams, DRP_PORT_BASE, MAX_DRPS,
    MRQ_PORT_BASE, NUM_PORTS, TEB_PORT_BASE,
};

fn connect_body() -> serde_json::Value {
    json!({
        "teb": {
            "4242": {
                "teb_id": 0,
                "connect_info": {"nic_ip": "10.0.0.5"},
            },
        },
        "drp": {
            "drp0": {
                "drp_id": 0,
                "connect_info": {"nic_ip": "10.0.0.10"},
                "det_info": {"readout": 0},
            },
            "drp1": {
                "drp_id": 1,
                "connect_info": {"nic_ip": "10.0.0.11"},
                "det_info": {"readout": 2},
            },
        },
        "meb": {
            "meb0": {"meb_id": 0},
        },
    })
}

#[test]
fn listen_ports_derive_from_partition_and_id() {
    assert_eq!(teb_port(0, 0) as u32, TEB_PORT_BASE);
    assert_eq!(teb_port(3, 5) as u32, TEB_PORT_BASE + NUM_PORTS * 3 + 5);
    assert_eq!(drp_port(2, 7) as u32, DRP_PORT_BASE + NUM_PORTS * 2 + 7);
    assert_eq!(mrq_port(1, 4) as u32, MRQ_PORT_BASE + NUM_PORTS + 4);
}

#[test]
fn connect_body_populates_the_parameter_snapshot() {
    let mut prms = EbParams {
        partition: 3,
        ..EbParams::default()
    };
    parse_connection_params(&connect_body(), 4242, &mut prms).expect("parse");

    assert_eq!(prms.id, 0);
    assert_eq!(prms.if_addr, "10.0.0.5");
    assert_eq!(prms.eb_port, teb_port(3, 0));
    assert_eq!(prms.mrq_port, mrq_port(3, 0));
    assert_eq!(prms.contributors, 0b11);
    assert_eq!(prms.addrs, vec!["10.0.0.10", "10.0.0.11"]);
    assert_eq!(prms.ports, vec![drp_port(3, 0), drp_port(3, 1)]);
    assert_eq!(prms.num_mrqs, 1);

    // Only the readout groups present in the topology get masks, and the
    // receivers of each group contain its contractors.
    assert_eq!(prms.contractors[0], 0b11);
    assert_eq!(prms.receivers[0], 0b11);
    assert_eq!(prms.contractors[2], 0b11);
    assert_eq!(prms.contractors[1], 0);
    for group in 0..prms.contractors.len() {
        let contractors = prms.contractors[group];
        let receivers = prms.receivers[group];
        assert_eq!(contractors & receivers, contractors);
    }
}

#[test]
fn out_of_range_teb_id_is_rejected() {
    let mut body = connect_body();
    body["teb"]["4242"]["teb_id"] = json!(99);
    let mut prms = EbParams {
        partition: 0,
        ..EbParams::default()
    };
    let err = parse_connection_params(&body, 4242, &mut prms).expect_err("bad teb id");
    assert!(err.contains("out of range"));
}

#[test]
fn out_of_range_drp_id_is_rejected() {
    let mut body = connect_body();
    body["drp"]["drp1"]["drp_id"] = json!(MAX_DRPS);
    let mut prms = EbParams {
        partition: 0,
        ..EbParams::default()
    };
    let err = parse_connection_params(&body, 4242, &mut prms).expect_err("bad drp id");
    assert!(err.contains("out of range"));
}

#[test]
fn a_topology_without_contributors_is_rejected() {
    let mut body = connect_body();
    body["drp"] = json!({});
    let mut prms = EbParams {
        partition: 0,
        ..EbParams::default()
    };
    let err = parse_connection_params(&body, 4242, &mut prms).expect_err("no drps");
    assert!(err.contains("DRP address"));
}

#[test]
fn missing_teb_entry_is_rejected() {
    let body = json!({"teb": {}, "drp": {}});
    let mut prms = EbParams::default();
    let err = parse_connection_params(&body, 4242, &mut prms).expect_err("no teb entry");
    assert!(err.contains("teb_id"));
}

#[test]
fn create_msg_uses_the_shared_schema() {
    let msg = teb::create_msg("connect", json!("m-7"), 4242, json!({"error": "Connect error"}));
    assert_eq!(msg["header"]["key"], "connect");
    assert_eq!(msg["header"]["msg_id"], "m-7");
    assert_eq!(msg["header"]["sender_id"], 4242);
    assert_eq!(msg["body"]["error"], "Connect error");
}
