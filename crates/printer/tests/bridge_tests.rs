//! Bridge handler integration tests
//!
//! Exercises every bridge method against the simulated USB host, both
//! directly and through the framed stdio server.
//!
//! Run with: `cargo test -p printer --test bridge_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, POS58_PRODUCT_ID, POS58_VENDOR_ID, create_mock_descriptor_list,
    create_mock_printer, wait_until, with_timeout,
};
use printer::bridge::{BridgeHandler, INVALID_ARGUMENTS};
use printer::serve::{INCOMPATIBLE_VERSION, serve};
use printer::usb::{ConnectionState, PrinterAdapter, SimulatedHost};
use protocol::{
    CURRENT_VERSION, CallId, Message, MessagePayload, MethodCall, MethodResponse, ProtocolVersion,
    Value, decode_framed, encode_framed,
};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, duplex};

fn setup() -> (BridgeHandler, Arc<SimulatedHost>) {
    let adapter = Arc::new(PrinterAdapter::default());
    let host = Arc::new(SimulatedHost::new(adapter.event_sink()));
    adapter.init(host.clone());
    (BridgeHandler::new(adapter), host)
}

fn connect_call(vendor: i64, product: i64) -> MethodCall {
    MethodCall::new("connectPrinter")
        .with_arg("vendor", vendor)
        .with_arg("product", product)
}

fn assert_invalid_arguments(response: MethodResponse, expected_message: &str) {
    match response {
        MethodResponse::Error { code, message, .. } => {
            assert_eq!(code, INVALID_ARGUMENTS);
            assert_eq!(message, expected_message);
        }
        other => panic!("Expected INVALID_ARGUMENTS, got {:?}", other),
    }
}

// ============================================================================
// Method Dispatch
// ============================================================================

#[test]
fn test_device_list_empty() {
    let (handler, _host) = setup();
    let response = handler.handle(&MethodCall::new("getUSBDeviceList"));
    assert_eq!(response, MethodResponse::Success(Value::List(vec![])));
}

#[test]
fn test_device_list_records() {
    let (handler, host) = setup();
    for device in create_mock_descriptor_list(2) {
        host.add_printer(device);
    }

    let response = handler.handle(&MethodCall::new("getUSBDeviceList"));
    let list = response.value().and_then(Value::as_list).unwrap();
    assert_eq!(list.len(), 2);

    let first = list[0].as_map().unwrap();
    assert_eq!(first["vendorid"], Value::from("4097"));
    assert_eq!(first["productid"], Value::from("8193"));
    assert_eq!(first["deviceid"], Value::from("1"));
    assert_eq!(first["product"], Value::from("Test Printer 1"));
    assert_eq!(first.len(), 6);
}

#[test]
fn test_connect_printer() {
    let (handler, host) = setup();
    host.add_printer(create_mock_printer(1));

    let response = handler.handle(&connect_call(0x0483, 0x5743));
    assert_eq!(response, MethodResponse::success(true));
    assert_eq!(
        handler.adapter().state(),
        ConnectionState::PermissionPending
    );

    let response = handler.handle(&connect_call(0x1234, 0x5678));
    assert_eq!(response, MethodResponse::success(false));
}

#[test]
fn test_connect_printer_out_of_range_ids() {
    let (handler, host) = setup();
    host.add_printer(create_mock_printer(1));

    assert_eq!(
        handler.handle(&connect_call(70000, 0x5743)),
        MethodResponse::success(false)
    );
    assert_eq!(
        handler.handle(&connect_call(0x0483, -1)),
        MethodResponse::success(false)
    );
}

#[test]
fn test_print_calls_answer_true() {
    let (handler, host) = setup();
    host.add_printer(create_mock_printer(1));
    host.set_permitted(1, true);
    assert_eq!(
        handler.handle(&connect_call(
            POS58_VENDOR_ID as i64,
            POS58_PRODUCT_ID as i64
        )),
        MethodResponse::success(true)
    );

    let text = MethodCall::new("printText").with_arg("text", "Hello\n");
    let raw = MethodCall::new("printRawData").with_arg("raw", "G0A=");
    let write = MethodCall::new("write").with_arg("data", vec![0x1Du8, 0x56, 0x01]);

    assert_eq!(handler.handle(&text), MethodResponse::success(true));
    assert_eq!(handler.handle(&raw), MethodResponse::success(true));
    assert_eq!(handler.handle(&write), MethodResponse::success(true));

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || host.writes().len() == 3));
    let data: Vec<Vec<u8>> = host.writes().into_iter().map(|w| w.data).collect();
    assert_eq!(
        data,
        vec![b"Hello\n".to_vec(), vec![0x1B, 0x40], vec![0x1D, 0x56, 0x01]]
    );
}

#[test]
fn test_print_without_printer_still_answers_true() {
    let (handler, host) = setup();

    let text = MethodCall::new("printText").with_arg("text", "Hello");
    let raw = MethodCall::new("printRawData").with_arg("raw", "%%%");

    assert_eq!(handler.handle(&text), MethodResponse::success(true));
    assert_eq!(handler.handle(&raw), MethodResponse::success(true));
    assert!(host.writes().is_empty());
}

#[test]
fn test_close_conn() {
    let (handler, host) = setup();
    host.add_printer(create_mock_printer(1));
    host.set_permitted(1, true);
    handler.handle(&connect_call(0x0483, 0x5743));
    assert!(handler.adapter().open_connection());

    let response = handler.handle(&MethodCall::new("closeConn"));
    assert_eq!(response, MethodResponse::success(true));
    assert_eq!(host.close_count(), 1);

    let response = handler.handle(&MethodCall::new("closeConn"));
    assert_eq!(response, MethodResponse::success(true));
    assert_eq!(host.close_count(), 1);
}

#[test]
fn test_unknown_method_not_implemented() {
    let (handler, _host) = setup();
    assert_eq!(
        handler.handle(&MethodCall::new("openCashDrawer")),
        MethodResponse::NotImplemented
    );
}

// ============================================================================
// Argument Validation
// ============================================================================

#[test]
fn test_missing_arguments() {
    let (handler, _host) = setup();

    assert_invalid_arguments(
        handler.handle(&MethodCall::new("printText")),
        "Missing text argument",
    );
    assert_invalid_arguments(
        handler.handle(&MethodCall::new("printRawData")),
        "Missing raw argument",
    );
    assert_invalid_arguments(
        handler.handle(&MethodCall::new("write")),
        "Missing data argument",
    );
    assert_invalid_arguments(
        handler.handle(&MethodCall::new("connectPrinter").with_arg("vendor", 1155i64)),
        "Missing product argument",
    );
}

#[test]
fn test_mistyped_arguments() {
    let (handler, _host) = setup();

    assert_invalid_arguments(
        handler.handle(&connect_call(1, 2).with_arg("vendor", "0x0483")),
        "Argument vendor must be int, got string",
    );
    assert_invalid_arguments(
        handler.handle(&MethodCall::new("write").with_arg("data", "bytes?")),
        "Argument data must be bytes, got string",
    );
    assert_invalid_arguments(
        handler.handle(&MethodCall::new("printText").with_arg("text", true)),
        "Argument text must be string, got bool",
    );
}

// ============================================================================
// Framed Server
// ============================================================================

fn call_frame(id: u64, call: MethodCall) -> Vec<u8> {
    encode_framed(&Message {
        version: CURRENT_VERSION,
        payload: MessagePayload::Call {
            id: CallId(id),
            call,
        },
    })
    .unwrap()
}

async fn read_reply<R>(reader: &mut R) -> (CallId, MethodResponse)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let frame = protocol::read_framed_async(reader).await.unwrap();
    match decode_framed(&frame).unwrap().payload {
        MessagePayload::Reply { id, response } => (id, response),
        other => panic!("Expected reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_serve_answers_calls_in_order() {
    let (handler, host) = setup();
    host.add_printer(create_mock_printer(1));

    let (mut client, server) = duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let task = tokio::spawn(serve(handler, server_read, server_write));

    client
        .write_all(&call_frame(1, MethodCall::new("getUSBDeviceList")))
        .await
        .unwrap();
    client
        .write_all(&call_frame(2, connect_call(0x0483, 0x5743)))
        .await
        .unwrap();
    client
        .write_all(&call_frame(3, MethodCall::new("feedPaper")))
        .await
        .unwrap();

    let (id, response) = read_reply(&mut client).await;
    assert_eq!(id, CallId(1));
    assert_eq!(response.value().and_then(Value::as_list).unwrap().len(), 1);

    let (id, response) = read_reply(&mut client).await;
    assert_eq!(id, CallId(2));
    assert_eq!(response, MethodResponse::success(true));

    let (id, response) = read_reply(&mut client).await;
    assert_eq!(id, CallId(3));
    assert_eq!(response, MethodResponse::NotImplemented);

    drop(client);
    let answered = with_timeout(DEFAULT_TEST_TIMEOUT, task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(answered, 3);
}

#[tokio::test]
async fn test_serve_rejects_incompatible_version() {
    let (handler, _host) = setup();
    let (mut client, server) = duplex(4096);
    let (server_read, server_write) = tokio::io::split(server);
    let task = tokio::spawn(serve(handler, server_read, server_write));

    let frame = encode_framed(&Message {
        version: ProtocolVersion {
            major: CURRENT_VERSION.major + 1,
            minor: 0,
            patch: 0,
        },
        payload: MessagePayload::Call {
            id: CallId(9),
            call: MethodCall::new("closeConn"),
        },
    })
    .unwrap();
    client.write_all(&frame).await.unwrap();

    let (id, response) = read_reply(&mut client).await;
    assert_eq!(id, CallId(9));
    assert!(matches!(
        response,
        MethodResponse::Error { ref code, .. } if code == INCOMPATIBLE_VERSION
    ));

    drop(client);
    assert!(with_timeout(DEFAULT_TEST_TIMEOUT, task).await.is_ok());
}
