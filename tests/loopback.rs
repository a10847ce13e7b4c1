//! End-to-end exchanges between the acceptor and a peer over loopback.

use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use dicom_ul::{ClientAssociation, ClientAssociationOptions};
use tokio_util::sync::CancellationToken;

use dimse_mpps::types::{
    CommandField, CommandSet, IMPLICIT_VR_LITTLE_ENDIAN,
    MODALITY_PERFORMED_PROCEDURE_STEP_SOP_CLASS, STATUS_NO_SUCH_SOP_CLASS, STATUS_SUCCESS,
    VERIFICATION_SOP_CLASS,
};
use dimse_mpps::{
    AssociationInfo, CommandInfo, MppsScp, ProfileRegistry, ScpConfig, ScuConfig, SessionMonitor,
    StorageCommitmentScu,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Records lifecycle events so tests can assert on the association's
/// history after the fact.
#[derive(Default)]
struct RecordingMonitor {
    events: Mutex<Vec<String>>,
}

impl RecordingMonitor {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

impl SessionMonitor for RecordingMonitor {
    fn association_received(&self, _info: &AssociationInfo) {
        self.push("received");
    }
    fn association_acknowledged(&self, _info: &AssociationInfo) {
        self.push("acknowledged");
    }
    fn association_refused(&self, _info: &AssociationInfo, reason: &dimse_mpps::RefuseReason) {
        self.push(format!("refused: {reason}"));
    }
    fn release_requested(&self, _info: &AssociationInfo) {
        self.push("release");
    }
    fn association_terminated(&self, _info: &AssociationInfo) {
        self.push("terminated");
    }
    fn command_dispatched(&self, _info: &AssociationInfo, command: &CommandInfo) {
        self.push(format!("command: {}", command.field));
    }
    fn dimse_error(&self, _info: &AssociationInfo, error: &dimse_mpps::DimseError) {
        self.push(format!("error: {error}"));
    }
}

struct TestServer {
    addr: SocketAddr,
    scp: Arc<MppsScp>,
    token: CancellationToken,
    handle: tokio::task::JoinHandle<dimse_mpps::Result<()>>,
    monitor: Arc<RecordingMonitor>,
}

impl TestServer {
    async fn start() -> Self {
        init_logging();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = ScpConfig {
            accept_poll_ms: 50,
            acse_timeout_ms: 5000,
            ..ScpConfig::default()
        };
        let monitor = Arc::new(RecordingMonitor::default());
        let scp = Arc::new(
            MppsScp::with_monitor(config, &ProfileRegistry::builtin(), monitor.clone()).unwrap(),
        );
        let token = scp.shutdown_handle();
        let serve_scp = scp.clone();
        let handle = tokio::spawn(async move { serve_scp.serve(listener).await });

        Self {
            addr,
            scp,
            token,
            handle,
            monitor,
        }
    }

    async fn stop(self) -> Vec<String> {
        // let in-flight association workers finish before asserting
        while self.scp.active_associations() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        self.token.cancel();
        self.handle.await.unwrap().unwrap();
        self.monitor.events()
    }
}

fn receive_command(assoc: &mut ClientAssociation<TcpStream>) -> CommandSet {
    let mut buffer = Vec::new();
    loop {
        match assoc.receive().unwrap() {
            Pdu::PData { data } => {
                for value in data {
                    assert_eq!(value.value_type, PDataValueType::Command);
                    let is_last = value.is_last;
                    buffer.extend_from_slice(&value.data);
                    if is_last {
                        return CommandSet::decode(&buffer).unwrap();
                    }
                }
            }
            other => panic!("unexpected PDU while awaiting response: {other:?}"),
        }
    }
}

fn send_command(assoc: &mut ClientAssociation<TcpStream>, context_id: u8, command: &CommandSet) {
    assoc
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command.encode().unwrap(),
            }],
        })
        .unwrap();
}

fn send_dataset(assoc: &mut ClientAssociation<TcpStream>, context_id: u8, dataset: &InMemDicomObject) {
    let ts = dimse_mpps::types::lookup_transfer_syntax(IMPLICIT_VR_LITTLE_ENDIAN).unwrap();
    let mut encoded = Vec::new();
    dataset.write_dataset_with_ts(&mut encoded, ts).unwrap();
    assoc
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: context_id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: encoded,
            }],
        })
        .unwrap();
}

fn commitment_report() -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::TRANSACTION_UID,
        VR::UI,
        dicom_value!(Str, "2.25.111222333444555666777888999"),
    ));
    obj
}

#[tokio::test]
async fn scu_delivers_commitment_result_over_loopback() {
    let server = TestServer::start().await;

    let config = ScuConfig {
        acse_timeout_ms: 5000,
        ..ScuConfig::new("MPPSSCP", "127.0.0.1", server.addr.port())
    };
    let profile = ProfileRegistry::builtin().get("DEFAULT").unwrap().clone();
    let scu = StorageCommitmentScu::new(config, profile).unwrap();

    let (_scu, result) = scu.spawn(1, commitment_report()).await.unwrap();
    result.unwrap();

    let events = server.stop().await;
    assert!(events.contains(&"acknowledged".to_string()), "{events:?}");
    assert!(events.contains(&"command: C-ECHO-RQ".to_string()), "{events:?}");
    assert!(
        events.contains(&"command: N-EVENT-REPORT-RQ".to_string()),
        "{events:?}"
    );
    assert!(events.contains(&"release".to_string()), "{events:?}");
    assert!(events.contains(&"terminated".to_string()), "{events:?}");
}

#[tokio::test]
async fn procedure_step_create_and_set_are_acknowledged_in_order() {
    let server = TestServer::start().await;
    let addr = server.addr;

    let exchange = tokio::task::spawn_blocking(move || {
        let mut assoc = ClientAssociationOptions::new()
            .calling_ae_title("MODALITY")
            .called_ae_title("MPPSSCP")
            .with_presentation_context(
                MODALITY_PERFORMED_PROCEDURE_STEP_SOP_CLASS,
                vec![IMPLICIT_VR_LITTLE_ENDIAN],
            )
            .max_pdu_length(16384)
            .establish_with(&format!("MPPSSCP@{addr}"))
            .unwrap();
        let context_id = assoc.presentation_contexts()[0].id;

        let mut step = InMemDicomObject::new_empty();
        step.put(DataElement::new(
            tags::PERFORMED_PROCEDURE_STEP_STATUS,
            VR::CS,
            dicom_value!(Str, "IN PROGRESS"),
        ));

        // create without naming an instance, the acceptor picks one
        let create = CommandSet {
            field: CommandField::NCreateRq,
            message_id: Some(1),
            responded_to: None,
            affected_sop_class: Some(MODALITY_PERFORMED_PROCEDURE_STEP_SOP_CLASS.to_string()),
            requested_sop_class: None,
            affected_sop_instance: None,
            requested_sop_instance: None,
            status: None,
            event_type_id: None,
            has_dataset: true,
        };
        send_command(&mut assoc, context_id, &create);
        send_dataset(&mut assoc, context_id, &step);

        let response = receive_command(&mut assoc);
        assert_eq!(response.field, CommandField::NCreateRsp);
        assert_eq!(response.responded_to, Some(1));
        assert_eq!(response.status, Some(STATUS_SUCCESS));
        let instance = response.affected_sop_instance.expect("generated instance");
        assert!(instance.starts_with("2.25."));

        let mut update = InMemDicomObject::new_empty();
        update.put(DataElement::new(
            tags::PERFORMED_PROCEDURE_STEP_STATUS,
            VR::CS,
            dicom_value!(Str, "COMPLETED"),
        ));
        let set = CommandSet {
            field: CommandField::NSetRq,
            message_id: Some(2),
            responded_to: None,
            affected_sop_class: None,
            requested_sop_class: Some(MODALITY_PERFORMED_PROCEDURE_STEP_SOP_CLASS.to_string()),
            affected_sop_instance: None,
            requested_sop_instance: Some(instance),
            status: None,
            event_type_id: None,
            has_dataset: true,
        };
        send_command(&mut assoc, context_id, &set);
        send_dataset(&mut assoc, context_id, &update);

        let response = receive_command(&mut assoc);
        assert_eq!(response.field, CommandField::NSetRsp);
        assert_eq!(response.responded_to, Some(2));
        assert_eq!(response.status, Some(STATUS_SUCCESS));

        // a create for an unsupported SOP class is refused
        let bogus = CommandSet {
            affected_sop_class: Some(VERIFICATION_SOP_CLASS.to_string()),
            message_id: Some(3),
            has_dataset: false,
            ..create.clone()
        };
        send_command(&mut assoc, context_id, &bogus);
        let response = receive_command(&mut assoc);
        assert_eq!(response.responded_to, Some(3));
        assert_eq!(response.status, Some(STATUS_NO_SUCH_SOP_CLASS));
        assert!(response.affected_sop_instance.is_none());

        assoc.release().unwrap();
    });
    exchange.await.unwrap();

    let events = server.stop().await;
    let commands: Vec<&String> = events.iter().filter(|e| e.starts_with("command")).collect();
    assert_eq!(
        commands,
        vec!["command: N-CREATE-RQ", "command: N-SET-RQ", "command: N-CREATE-RQ"]
    );
    assert!(events.contains(&"release".to_string()), "{events:?}");
}

#[tokio::test]
async fn association_without_acceptable_transfer_syntax_is_refused() {
    let server = TestServer::start().await;
    let addr = server.addr;

    // Explicit VR Big Endian only, which the default profile does not allow
    let attempt = tokio::task::spawn_blocking(move || {
        ClientAssociationOptions::new()
            .calling_ae_title("MODALITY")
            .called_ae_title("MPPSSCP")
            .with_presentation_context(
                MODALITY_PERFORMED_PROCEDURE_STEP_SOP_CLASS,
                vec!["1.2.840.10008.1.2.2"],
            )
            .establish_with(&format!("MPPSSCP@{addr}"))
            .map(|_| ())
    });
    assert!(attempt.await.unwrap().is_err());

    let events = server.stop().await;
    assert!(
        events
            .iter()
            .any(|e| e.contains("no acceptable presentation contexts")),
        "{events:?}"
    );
}

#[tokio::test]
async fn unknown_called_ae_title_is_refused() {
    let server = TestServer::start().await;

    let config = ScuConfig {
        acse_timeout_ms: 5000,
        ..ScuConfig::new("SOMEBODY", "127.0.0.1", server.addr.port())
    };
    let profile = ProfileRegistry::builtin().get("DEFAULT").unwrap().clone();
    let mut scu = StorageCommitmentScu::new(config, profile).unwrap();

    let connect = tokio::task::spawn_blocking(move || {
        let result = scu.connect();
        (scu, result)
    });
    let (scu, result) = connect.await.unwrap();
    assert!(result.is_err());
    assert!(!scu.is_connected());

    let events = server.stop().await;
    assert!(
        events.iter().any(|e| e.starts_with("refused")),
        "{events:?}"
    );
}
