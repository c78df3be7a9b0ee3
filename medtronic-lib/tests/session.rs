mod common;
use common::*;

use medtronic_lib::cgm::CgmInfo;
use medtronic_lib::history::RecordType;
use medtronic_lib::response::BatteryStatus;
use medtronic_lib::session::{Button, MAX_DOWNLOAD_FRAMES, WAKEUP_FRAMES};
use medtronic_lib::tune::SearchBand;

fn battery_reply() -> Reply {
    frame(Opcode::GetBattery, &[0x03, 0x00, 0x00, 0x96])
}

#[tokio::test(start_paused = true)]
async fn battery_query() {
    let mut session = session([battery_reply()]);
    let status = session.battery().await.unwrap();
    assert_eq!(
        status,
        BatteryStatus {
            low: false,
            millivolts: 1500
        }
    );
    let radio = session.radio();
    assert_eq!(radio.sent, [vec![0xA7, 0x12, 0x89, 0x86, 0x72, 0x00]]);
    assert_eq!(radio.frequency, 916_600_000);
    assert_eq!(session.last_rssi(), REPLY_RSSI);
}

#[tokio::test(start_paused = true)]
async fn retries_through_silence_and_noise() {
    let mut session = session([Reply::Silence, Reply::Raw(vec![0xFF; 12]), battery_reply()]);
    assert!(session.battery().await.is_ok());
    assert_eq!(session.radio().sent.len(), 3);
    let stats = session.stats();
    assert_eq!(stats.commands, 1);
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.decode_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_stick() {
    let mut session = session([Reply::Silence, Reply::Silence, Reply::Silence]);
    let err = session.battery().await.unwrap_err();
    assert_eq!(
        err,
        MdtError::NoResponse {
            opcode: Opcode::GetBattery
        }
    );
    assert_eq!(session.radio().sent.len(), 3);

    // Later calls fail with the same error and never reach the radio.
    session.radio_mut().push(battery_reply());
    assert_eq!(session.battery().await.unwrap_err(), err);
    assert_eq!(session.radio().sent.len(), 3);
    assert_eq!(session.error(), Some(&err));

    session.clear_error();
    assert!(session.battery().await.is_ok());
    assert_eq!(session.radio().sent.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn nak_aborts_without_retry() {
    let mut session = session([frame(Opcode::Nak, &[0x08]), battery_reply()]);
    let err = session.battery().await.unwrap_err();
    assert!(matches!(
        err,
        MdtError::UnexpectedResponse {
            opcode: Opcode::GetBattery,
            ..
        }
    ));
    assert_eq!(session.radio().sent.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn other_pumps_are_ignored() {
    let stranger = vec![0xA7, 0x99, 0x99, 0x99, 0x72, 0x03, 0x00, 0x00, 0x96];
    let mut session = session([Reply::Frame(stranger), battery_reply()]);
    assert!(session.battery().await.is_ok());
    assert_eq!(session.radio().sent.len(), 2);
    assert_eq!(session.stats().mismatched, 1);
}

#[tokio::test(start_paused = true)]
async fn bolus_is_sent_once() {
    let mut session = session([model("522"), Reply::Silence, Reply::Silence]);
    let err = session.bolus(Insulin(1500)).await.unwrap_err();
    assert_eq!(err, MdtError::NoResponse { opcode: Opcode::Bolus });
    let radio = session.radio();
    assert_eq!(radio.sent.len(), 2);
    assert_eq!(radio.sent[1], [0xA7, 0x12, 0x89, 0x86, 0x42, 0x01, 0x0F]);
    assert_eq!(radio.pending(), 1);
}

#[tokio::test(start_paused = true)]
async fn state_changes_expect_ack() {
    let mut session = session([ack(), ack(), ack()]);
    session.suspend().await.unwrap();
    session.set_absolute_temp_basal(Insulin(1000), 90).await.unwrap();
    session.press_button(Button::Act).await.unwrap();
    let sent = &session.radio().sent;
    assert_eq!(sent[0], [0xA7, 0x12, 0x89, 0x86, 0x4D, 0x01, 0x01]);
    assert_eq!(sent[1], [0xA7, 0x12, 0x89, 0x86, 0x4C, 0x03, 0x00, 0x28, 0x03]);
    assert_eq!(sent[2], [0xA7, 0x12, 0x89, 0x86, 0x5B, 0x01, 0x02]);
}

#[tokio::test(start_paused = true)]
async fn invalid_parameters_never_reach_the_radio() {
    let mut session = session([ack()]);
    let err = session.set_percent_temp_basal(50, 45).await.unwrap_err();
    assert!(matches!(err, MdtError::InvalidParameter(_)));
    assert!(session.radio().sent.is_empty());
}

#[tokio::test(start_paused = true)]
async fn wakeup_sends_power_burst() {
    let mut session = session([Reply::Silence, ack()]);
    session.wakeup().await.unwrap();
    let sent = &session.radio().sent;
    assert_eq!(sent.len(), WAKEUP_FRAMES + 2);
    assert_eq!(sent[0], [0xA7, 0x12, 0x89, 0x86, 0x8D, 0x00]);
    assert_eq!(sent[1], [0xA7, 0x12, 0x89, 0x86, 0x5D, 0x00]);
    assert_eq!(sent.last().unwrap(), &[0xA7, 0x12, 0x89, 0x86, 0x5D, 0x01, 0x0A]);
    assert!(session.error().is_none());
}

#[tokio::test(start_paused = true)]
async fn wakeup_skips_burst_when_awake() {
    let mut session = session([model("523")]);
    session.wakeup().await.unwrap();
    assert_eq!(session.family().await.unwrap(), Family(23));
    assert_eq!(session.radio().sent.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn basal_schedule_spans_two_frames() {
    let mut session = session([
        frame(Opcode::BasalRates, &[0x01, 0x09, 0x28, 0x00, 0x00, 0x32, 0x00]),
        frame(Opcode::BasalRates, &[0x82, 0x0C, 0x28, 0x00, 0x2C]),
    ]);
    let schedule = session.basal_rates().await.unwrap();
    let entries: Vec<_> = schedule
        .entries()
        .iter()
        .map(|e| (e.start.to_string(), e.value))
        .collect();
    assert_eq!(
        entries,
        [
            ("00:00:00".to_string(), Insulin(1000)),
            ("06:00:00".to_string(), Insulin(1250)),
            ("22:00:00".to_string(), Insulin(1000)),
        ]
    );
    let sent = &session.radio().sent;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1], [0xA7, 0x12, 0x89, 0x86, 0x06, 0x00]);
}

#[tokio::test(start_paused = true)]
async fn history_page_drops_duplicate_frames() {
    let page = sealed_page(&base_record(0x21, 0, pump_time(15, 51, 29)));
    let mut replies = multi_frame(Opcode::HistoryPage, &page);
    assert_eq!(replies.len(), 16);
    replies.insert(2, replies[1].clone());

    let mut session = session(replies);
    let payload = session.history_page(0).await.unwrap();
    assert_eq!(payload, page[..1022]);
    let sent = &session.radio().sent;
    assert_eq!(sent.len(), 17);
    assert_eq!(sent[0], [0xA7, 0x12, 0x89, 0x86, 0x80, 0x01, 0x00]);
    assert!(sent[1..].iter().all(|f| f == &[0xA7, 0x12, 0x89, 0x86, 0x06, 0x00]));
    assert_eq!(session.stats().duplicate_frames, 1);
}

#[tokio::test(start_paused = true)]
async fn history_page_rejects_skipped_frames() {
    let page = sealed_page(&[]);
    let mut replies = multi_frame(Opcode::HistoryPage, &page);
    replies.remove(1);
    let mut session = session(replies);
    let err = session.history_page(0).await.unwrap_err();
    assert!(matches!(
        err,
        MdtError::UnexpectedResponse {
            opcode: Opcode::HistoryPage,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn corrupted_page_checksum_sticks() {
    let mut page = sealed_page(&base_record(0x21, 0, pump_time(15, 51, 29)));
    let crc = u16::from_be_bytes([page[1022], page[1023]]);
    page[1023] ^= 0xFF;
    let mut session = session(multi_frame(Opcode::HistoryPage, &page));

    let err = session.history_page(0).await.unwrap_err();
    assert_eq!(
        err,
        MdtError::PageChecksum {
            expected: crc,
            actual: crc ^ 0x00FF
        }
    );
    let sent = session.radio().sent.len();
    assert_eq!(session.battery().await.unwrap_err(), err);
    assert_eq!(session.radio().sent.len(), sent);
}

#[tokio::test(start_paused = true)]
async fn history_records_stop_at_cutoff() {
    let mut newest = base_record(0x1E, 0, pump_time(12, 0, 0));
    newest.extend(base_record(0x1F, 0, pump_time(13, 0, 0)));
    let mut older = base_record(0x1E, 0, pump_time(10, 0, 0));
    older.extend(base_record(0x1F, 0, pump_time(11, 0, 0)));

    let mut replies = vec![model("522"), frame(Opcode::LastHistoryPage, &[0x04, 0, 0, 0, 5])];
    replies.extend(multi_frame(Opcode::HistoryPage, &sealed_page(&newest)));
    replies.extend(multi_frame(Opcode::HistoryPage, &sealed_page(&older)));
    let mut session = session(replies);

    let records = session.history_records(on_test_day(10, 30, 0)).await.unwrap();
    let summary: Vec<_> = records.iter().map(|r| (r.kind, r.time)).collect();
    assert_eq!(
        summary,
        [
            (RecordType::ResumePump, Some(on_test_day(13, 0, 0))),
            (RecordType::SuspendPump, Some(on_test_day(12, 0, 0))),
            (RecordType::ResumePump, Some(on_test_day(11, 0, 0))),
        ]
    );
    let radio = session.radio();
    assert_eq!(radio.sent.len(), 34);
    assert_eq!(radio.sent[18], [0xA7, 0x12, 0x89, 0x86, 0x80, 0x01, 0x01]);
    assert_eq!(radio.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn history_records_return_prefix_on_failure() {
    let mut page = base_record(0x1E, 0, pump_time(12, 0, 0));
    page.push(0xEE);
    let mut replies = vec![model("522"), frame(Opcode::LastHistoryPage, &[0x04, 0, 0, 0, 0])];
    replies.extend(multi_frame(Opcode::HistoryPage, &sealed_page(&page)));
    let mut session = session(replies);

    let partial = session.history_records(on_test_day(0, 0, 0)).await.unwrap_err();
    assert_eq!(partial.records.len(), 1);
    assert_eq!(partial.records[0].kind, RecordType::SuspendPump);
    assert!(matches!(partial.error, MdtError::UnknownRecordType { .. }));
    assert_eq!(session.error(), Some(&partial.error));
}

#[tokio::test(start_paused = true)]
async fn cgm_records_walk_down_from_current_page() {
    // 2016-06-06 15:51 and 14:51, both page-end markers
    let current = [0x4F, 0xB3, 0x26, 0x10, 0x08, 0x40, 0x41, 0x42];
    let previous = [0x40, 0x40, 0x4E, 0xB3, 0x26, 0x10, 0x08];

    let mut replies = vec![frame(Opcode::CgmPageCount, &[0x04, 0, 0, 0, 1])];
    replies.extend(multi_frame(Opcode::GlucosePage, &sealed_page(&current)));
    replies.extend(multi_frame(Opcode::GlucosePage, &sealed_page(&previous)));
    let mut session = session(replies);

    let records = session.cgm_records(on_test_day(15, 0, 0)).await.unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].info, CgmInfo::Glucose(0x84));
    assert_eq!(records[0].time, Some(on_test_day(16, 6, 0)));
    assert_eq!(records[3].time, Some(on_test_day(15, 51, 0)));

    let sent = &session.radio().sent;
    assert_eq!(sent[1], [0xA7, 0x12, 0x89, 0x86, 0x9A, 0x04, 0x00, 0x00, 0x00, 0x01]);
    assert_eq!(sent[17], [0xA7, 0x12, 0x89, 0x86, 0x9A, 0x04, 0x00, 0x00, 0x00, 0x00]);
}

#[tokio::test(start_paused = true)]
async fn tune_finds_strongest_reply() {
    let center = 916_650_000u32;
    let radio = ScriptedRadio::responding(move |hz, sent| {
        let diff = hz.abs_diff(center);
        (sent.get(4) == Some(&0x8D) && diff <= 100_000)
            .then(|| (pump_reply(Opcode::GetModel, b"\x03523"), -40 - (diff / 10_000) as i32))
    });
    let mut session = Session::new(radio, SessionConfig::new(pump_id())).unwrap();
    let hz = session.tune(SearchBand::default()).await.unwrap();
    assert!(hz.abs_diff(center) <= 20_000, "{hz}");
    assert_eq!(session.config().frequency, hz);
    assert_eq!(session.radio().frequency, hz);
}

#[tokio::test(start_paused = true)]
async fn family_is_fixed_by_first_model_reply() {
    init_logging();
    let mut session = session([model("523"), model("515")]);
    assert_eq!(session.family().await.unwrap(), Family(23));
    assert_eq!(session.model().await.unwrap(), "515");
    assert_eq!(session.family().await.unwrap(), Family(23));
    assert_eq!(session.radio().sent.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn endlessly_repeated_frame_is_abandoned() {
    init_logging();
    let mut first = vec![0x01];
    first.extend_from_slice(&[0x55; 64]);
    let replies = vec![frame(Opcode::HistoryPage, &first); 2 * MAX_DOWNLOAD_FRAMES];
    let mut session = session(replies);

    let err = session.history_page(0).await.unwrap_err();
    assert!(matches!(
        err,
        MdtError::BadResponse {
            opcode: Opcode::HistoryPage,
            ..
        }
    ));
    assert_eq!(session.radio().sent.len(), MAX_DOWNLOAD_FRAMES + 1);
    assert_eq!(session.stats().duplicate_frames as usize, MAX_DOWNLOAD_FRAMES - 1);
    assert_eq!(session.error(), Some(&err));
}
