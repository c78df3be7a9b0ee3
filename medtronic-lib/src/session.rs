//! Conversation with one pump over a radio.
//!
//! A [`Session`] owns the radio exclusively. Every command is a request frame
//! followed by a reply frame; long replies (history and CGM pages, basal
//! schedules) arrive as a run of frames, each acknowledged by the host.
//!
//! The session keeps the first failure as a sticky error: once set, every
//! later operation returns a copy of it without touching the radio until the
//! caller runs [`Session::clear_error`].

use crate::cgm::{self, CgmRecord};
use crate::command::{Opcode, command_frame, is_reply_to};
use crate::config::SessionConfig;
use crate::error::{MdtError, PartialDecode};
use crate::history::{self, HistoryRecord};
use crate::packet;
use crate::page::page_payload;
use crate::radio::{NO_SIGNAL_DBM, RadioOps};
use crate::response::{self, BatteryStatus, ClockRaw, PumpStatus, Settings, TempBasal};
use crate::schedule::{self, BasalSchedule, CarbRatios, GlucoseTargets, Sensitivities};
use crate::tune::{RssiProbe, SearchBand, ternary_search};
use crate::units::{CarbUnits, Family, GlucoseUnits, Insulin};
use chrono::NaiveDateTime;
use num_enum::IntoPrimitive;
use std::time::Duration;
use strum_macros::Display;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use zerocopy::IntoBytes;

/// Power-control frames sent to wake a sleeping pump.
pub const WAKEUP_FRAMES: usize = 150;
pub const WAKEUP_SPACING: Duration = Duration::from_millis(35);
/// Reply timeout of the power-control command that ends the wakeup burst.
pub const WAKEUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Minutes the pump keeps its receiver on after wakeup.
pub const RF_ON_MINUTES: u8 = 10;

/// Longest temp basal the pump accepts.
pub const MAX_TEMP_BASAL_MINUTES: u32 = 24 * 60;
pub const MAX_TEMP_BASAL_PERCENT: u8 = 200;

/// Offset of the reply payload within a decoded frame.
const PAYLOAD_OFFSET: usize = 5;

/// Bit 7 of the first payload byte marks the last frame of a multi-frame reply.
const LAST_FRAME: u8 = 0x80;

/// Frames accepted for one multi-frame reply, duplicates included. A page is
/// 16 full frames.
pub const MAX_DOWNLOAD_FRAMES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive)]
#[repr(u8)]
pub enum Button {
    Esc = 1,
    Act = 2,
    Up = 3,
    Down = 4,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SessionStats {
    pub commands: u32,
    pub attempts: u32,
    pub timeouts: u32,
    /// Frames that failed 4b/6b or CRC decoding.
    pub decode_errors: u32,
    /// Valid frames that did not answer the outstanding command.
    pub mismatched: u32,
    pub duplicate_frames: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Download {
    AwaitingFirst,
    AwaitingContinuation { last_seq: u8 },
    Done,
}

pub struct Session<R: RadioOps> {
    radio: R,
    config: SessionConfig,
    family: Option<Family>,
    error: Option<MdtError>,
    stats: SessionStats,
    last_rssi: i32,
}

impl<R: RadioOps> Session<R> {
    /// Take ownership of an opened radio and tune it to the configured frequency.
    pub fn new(mut radio: R, config: SessionConfig) -> Result<Self, MdtError> {
        radio.set_frequency(config.frequency)?;
        info!("Session for pump {} on {} Hz ({})", config.pump_id, config.frequency, radio.flavor().name);
        Ok(Self {
            radio,
            config,
            family: None,
            error: None,
            stats: SessionStats::default(),
            last_rssi: NO_SIGNAL_DBM,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// RSSI of the last accepted reply.
    pub fn last_rssi(&self) -> i32 {
        self.last_rssi
    }

    pub fn error(&self) -> Option<&MdtError> {
        self.error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Idle the radio and release it.
    pub fn close(mut self) -> Result<(), MdtError> {
        info!("Closing session");
        self.radio.close()
    }

    fn check(&self) -> Result<(), MdtError> {
        match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn record<T>(&mut self, result: Result<T, MdtError>) -> Result<T, MdtError> {
        if let Err(error) = &result {
            self.stick(error);
        }
        result
    }

    fn stick(&mut self, error: &MdtError) {
        if self.error.is_none() {
            self.error = Some(error.clone());
        }
    }

    /// Send `encoded` and wait for a frame that repeats the pump prefix with
    /// `expected` at offset 4. Timeouts, undecodable frames and frames for
    /// something else each use up one attempt. Returns the whole decoded frame.
    async fn transact(
        &mut self,
        opcode: Opcode,
        encoded: &[u8],
        expected: Opcode,
        attempts: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, MdtError> {
        for attempt in 1..=attempts {
            self.stats.attempts += 1;
            self.radio.send(encoded).await?;
            let (data, rssi) = self.radio.receive(timeout).await?;
            if data.is_empty() {
                self.stats.timeouts += 1;
                warn!("No reply to {} (attempt {}/{})", opcode, attempt, attempts);
                continue;
            }
            let reply = match packet::decode(&data) {
                Ok(reply) => reply,
                Err(error) if error.is_codec() => {
                    self.stats.decode_errors += 1;
                    warn!("Undecodable reply to {} (attempt {}/{}): {}", opcode, attempt, attempts, error);
                    continue;
                }
                Err(error) => return Err(error),
            };
            debug!(frame = %hex::encode(&reply), rssi, "reply to {}", opcode);
            if is_reply_to(&reply, self.config.pump_id, expected) {
                self.last_rssi = rssi;
                return Ok(reply);
            }
            if is_reply_to(&reply, self.config.pump_id, Opcode::Nak) {
                return Err(MdtError::UnexpectedResponse { opcode, bytes: reply });
            }
            self.stats.mismatched += 1;
            warn!(frame = %hex::encode(&reply), "Reply does not answer {} (attempt {}/{})", opcode, attempt, attempts);
        }
        Err(MdtError::NoResponse { opcode })
    }

    async fn exchange(
        &mut self,
        opcode: Opcode,
        params: &[u8],
        attempts: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, MdtError> {
        let frame = command_frame(self.config.pump_id, opcode, params)?;
        debug!(frame = %hex::encode(&frame), "command {}", opcode);
        self.stats.commands += 1;
        let encoded = packet::encode(&frame);
        self.transact(opcode, &encoded, opcode.expected_reply(), attempts, timeout).await
    }

    /// Run one command and return the reply payload.
    ///
    /// State-changing opcodes get exactly one attempt on the wire whatever
    /// the configured retry count.
    pub async fn execute(&mut self, opcode: Opcode, params: &[u8]) -> Result<Vec<u8>, MdtError> {
        self.check()?;
        let attempts = if opcode.is_state_changing() {
            1
        } else {
            self.config.retries
        };
        let result = self
            .exchange(opcode, params, attempts, self.config.timeout)
            .await
            .map(|reply| reply[PAYLOAD_OFFSET..].to_vec());
        self.record(result)
    }

    async fn query<T>(&mut self, opcode: Opcode, decode: impl FnOnce(&[u8]) -> Result<T, MdtError>) -> Result<T, MdtError> {
        let data = self.execute(opcode, &[]).await?;
        let result = decode(&data);
        self.record(result)
    }

    /// Wake the pump's receiver.
    ///
    /// A pump that answers a model query is already awake and the burst is
    /// skipped.
    pub async fn wakeup(&mut self) -> Result<(), MdtError> {
        self.check()?;
        let result = self.wakeup_inner().await;
        self.record(result)
    }

    async fn wakeup_inner(&mut self) -> Result<(), MdtError> {
        if let Ok(reply) = self.exchange(Opcode::GetModel, &[], 1, self.config.timeout).await {
            self.cache_family(&reply[PAYLOAD_OFFSET..]);
            info!("Pump is awake");
            return Ok(());
        }
        info!("Waking pump {}", self.config.pump_id);
        let encoded = packet::encode(&command_frame(self.config.pump_id, Opcode::PowerControl, &[])?);
        for _ in 0..WAKEUP_FRAMES {
            self.radio.send(&encoded).await?;
            sleep(WAKEUP_SPACING).await;
        }
        self.exchange(Opcode::PowerControl, &[RF_ON_MINUTES], 1, WAKEUP_TIMEOUT)
            .await?;
        info!("Pump woke up");
        Ok(())
    }

    fn cache_family(&mut self, data: &[u8]) {
        if let Some(family) = response::decode_model(data)
            .ok()
            .and_then(|model| Family::from_model(&model).ok())
        {
            self.remember_family(family);
        }
    }

    /// The first family seen holds for the rest of the session.
    fn remember_family(&mut self, family: Family) {
        if self.family.is_none() {
            self.family = Some(family);
        }
    }

    /// Reassemble a multi-frame reply.
    async fn download(&mut self, opcode: Opcode, params: &[u8]) -> Result<Vec<u8>, MdtError> {
        let retries = self.config.retries;
        let timeout = self.config.timeout;
        let mut payload = self.exchange(opcode, params, retries, timeout).await?.split_off(PAYLOAD_OFFSET);
        let ack = packet::encode(&command_frame(self.config.pump_id, Opcode::Ack, &[])?);
        let mut body = Vec::new();
        let mut state = Download::AwaitingFirst;
        for frames in 1.. {
            if frames > MAX_DOWNLOAD_FRAMES {
                return Err(MdtError::bad_response(opcode, format!("more than {MAX_DOWNLOAD_FRAMES} frames")));
            }
            let (&flags, data) = payload
                .split_first()
                .ok_or_else(|| MdtError::bad_response(opcode, "empty frame"))?;
            let seq = flags & !LAST_FRAME;
            let last = flags & LAST_FRAME != 0;
            state = match state {
                Download::AwaitingContinuation { last_seq } if seq == last_seq => {
                    self.stats.duplicate_frames += 1;
                    debug!("Dropping duplicate frame {}", seq);
                    state
                }
                Download::AwaitingContinuation { last_seq } if seq != (last_seq + 1) & !LAST_FRAME => {
                    return Err(MdtError::UnexpectedResponse { opcode, bytes: payload });
                }
                _ => {
                    body.extend_from_slice(data);
                    if last {
                        Download::Done
                    } else {
                        Download::AwaitingContinuation { last_seq: seq }
                    }
                }
            };
            if state == Download::Done {
                break;
            }
            payload = self.transact(opcode, &ack, opcode, retries, timeout).await?.split_off(PAYLOAD_OFFSET);
        }
        debug!("{} reply reassembled: {} bytes", opcode, body.len());
        Ok(body)
    }

    async fn download_page(&mut self, opcode: Opcode, params: &[u8]) -> Result<Vec<u8>, MdtError> {
        let page = self.download(opcode, params).await?;
        page_payload(&page).map(<[u8]>::to_vec)
    }

    async fn download_checked(&mut self, opcode: Opcode, params: &[u8]) -> Result<Vec<u8>, MdtError> {
        self.check()?;
        let result = self.download(opcode, params).await;
        self.record(result)
    }

    pub async fn model(&mut self) -> Result<String, MdtError> {
        let model = self.query(Opcode::GetModel, response::decode_model).await?;
        if let Ok(family) = Family::from_model(&model) {
            self.remember_family(family);
        }
        Ok(model)
    }

    /// Pump family, queried once and cached.
    pub async fn family(&mut self) -> Result<Family, MdtError> {
        if let Some(family) = self.family {
            return Ok(family);
        }
        let model = self.model().await?;
        let result = Family::from_model(&model);
        self.record(result)
    }

    pub async fn pump_id(&mut self) -> Result<String, MdtError> {
        self.query(Opcode::GetId, response::decode_pump_id).await
    }

    pub async fn firmware_version(&mut self) -> Result<String, MdtError> {
        self.query(Opcode::FirmwareVersion, response::decode_firmware_version).await
    }

    /// Pump-local wall-clock time.
    pub async fn clock(&mut self) -> Result<NaiveDateTime, MdtError> {
        self.query(Opcode::GetClock, response::decode_clock).await
    }

    pub async fn battery(&mut self) -> Result<BatteryStatus, MdtError> {
        self.query(Opcode::GetBattery, response::decode_battery).await
    }

    pub async fn reservoir(&mut self) -> Result<Insulin, MdtError> {
        let family = self.family().await?;
        self.query(Opcode::Reservoir, |data| response::decode_reservoir(data, family)).await
    }

    pub async fn status(&mut self) -> Result<PumpStatus, MdtError> {
        self.query(Opcode::Status, response::decode_status).await
    }

    pub async fn settings(&mut self) -> Result<Settings, MdtError> {
        let family = self.family().await?;
        self.query(Opcode::Settings, |data| response::decode_settings(data, family)).await
    }

    pub async fn temp_basal(&mut self) -> Result<TempBasal, MdtError> {
        self.query(Opcode::TempBasalRead, response::decode_temp_basal).await
    }

    pub async fn carb_units(&mut self) -> Result<CarbUnits, MdtError> {
        self.query(Opcode::CarbUnits, response::decode_carb_units).await
    }

    pub async fn glucose_units(&mut self) -> Result<GlucoseUnits, MdtError> {
        self.query(Opcode::GlucoseUnits, response::decode_glucose_units).await
    }

    /// Standard basal schedule.
    pub async fn basal_rates(&mut self) -> Result<BasalSchedule, MdtError> {
        self.basal_schedule(Opcode::BasalRates).await
    }

    pub async fn basal_pattern_a(&mut self) -> Result<BasalSchedule, MdtError> {
        self.basal_schedule(Opcode::BasalPatternA).await
    }

    pub async fn basal_pattern_b(&mut self) -> Result<BasalSchedule, MdtError> {
        self.basal_schedule(Opcode::BasalPatternB).await
    }

    async fn basal_schedule(&mut self, opcode: Opcode) -> Result<BasalSchedule, MdtError> {
        let body = self.download_checked(opcode, &[]).await?;
        let result = schedule::decode_basal_schedule(&body);
        self.record(result)
    }

    pub async fn carb_ratios(&mut self) -> Result<CarbRatios, MdtError> {
        let family = self.family().await?;
        self.query(Opcode::CarbRatios, |data| schedule::decode_carb_ratios(data, family)).await
    }

    pub async fn insulin_sensitivities(&mut self) -> Result<Sensitivities, MdtError> {
        self.query(Opcode::InsulinSensitivities, schedule::decode_sensitivities).await
    }

    pub async fn glucose_targets(&mut self) -> Result<GlucoseTargets, MdtError> {
        self.query(Opcode::Targets, schedule::decode_targets).await
    }

    /// Number of history pages worth reading.
    pub async fn last_history_page(&mut self) -> Result<u32, MdtError> {
        self.query(Opcode::LastHistoryPage, response::decode_history_page_count).await
    }

    /// One verified history page payload; page 0 is the most recent.
    pub async fn history_page(&mut self, page: u32) -> Result<Vec<u8>, MdtError> {
        self.check()?;
        let result = match u8::try_from(page) {
            Ok(n) => self.download_page(Opcode::HistoryPage, &[n]).await,
            Err(_) => Err(MdtError::InvalidParameter(format!("history page {page}"))),
        };
        self.record(result)
    }

    /// History records newer than `since`, newest first.
    ///
    /// Pages are read from the most recent backwards until a record older
    /// than `since` turns up. On failure the records gathered so far come
    /// back with the error.
    pub async fn history_records(
        &mut self,
        since: NaiveDateTime,
    ) -> Result<Vec<HistoryRecord>, PartialDecode<HistoryRecord>> {
        let family = self.family().await?;
        let count = self.last_history_page().await?;
        let mut out = Vec::new();
        for page in 0..count {
            let data = match self.history_page(page).await {
                Ok(data) => data,
                Err(error) => return Err(PartialDecode::new(out, error)),
            };
            let (mut records, failure) = match history::decode_page(&data, family) {
                Ok(records) => (records, None),
                Err(partial) => (partial.records, Some(partial.error)),
            };
            let reached = history::take_since(&mut records, since);
            out.append(&mut records);
            if let Some(error) = failure {
                self.stick(&error);
                return Err(PartialDecode::new(out, error));
            }
            if reached {
                break;
            }
        }
        info!("Read {} history records since {}", out.len(), since);
        Ok(out)
    }

    /// Current CGM page number.
    pub async fn cgm_page_count(&mut self) -> Result<u32, MdtError> {
        self.query(Opcode::CgmPageCount, response::decode_cgm_page_number).await
    }

    pub async fn cgm_page(&mut self, page: u32) -> Result<Vec<u8>, MdtError> {
        self.check()?;
        let result = self.download_page(Opcode::GlucosePage, &page.to_be_bytes()).await;
        self.record(result)
    }

    /// CGM records newer than `since`, newest first, walking pages down from
    /// the current one.
    pub async fn cgm_records(&mut self, since: NaiveDateTime) -> Result<Vec<CgmRecord>, PartialDecode<CgmRecord>> {
        let current = self.cgm_page_count().await?;
        let mut out = Vec::new();
        for page in (0..=current).rev() {
            let data = match self.cgm_page(page).await {
                Ok(data) => data,
                Err(error) => return Err(PartialDecode::new(out, error)),
            };
            let (mut records, failure) = match cgm::decode_page(&data) {
                Ok(records) => (records, None),
                Err(partial) => (partial.records, Some(partial.error)),
            };
            let reached = cgm::take_since(&mut records, since);
            out.append(&mut records);
            if let Some(error) = failure {
                self.stick(&error);
                return Err(PartialDecode::new(out, error));
            }
            if reached {
                break;
            }
        }
        info!("Read {} CGM records since {}", out.len(), since);
        Ok(out)
    }

    /// Set the pump's wall clock.
    pub async fn set_clock(&mut self, time: NaiveDateTime) -> Result<(), MdtError> {
        let raw = ClockRaw::from_naive(time);
        self.execute(Opcode::SetClock, &raw.as_bytes()[1..]).await.map(drop)
    }

    /// Deliver a normal bolus.
    pub async fn bolus(&mut self, amount: Insulin) -> Result<(), MdtError> {
        let family = self.family().await?;
        let params = self.record(bolus_params(amount, family))?;
        info!("Bolus {} U", amount);
        self.execute(Opcode::Bolus, &params).await.map(drop)
    }

    /// Start an absolute temp basal. `rate` is per hour.
    pub async fn set_absolute_temp_basal(&mut self, rate: Insulin, minutes: u32) -> Result<(), MdtError> {
        let params = half_hours(minutes).and_then(|half_hours| {
            let strokes = u16::try_from(rate.to_basal_strokes()?)
                .map_err(|_| MdtError::InvalidParameter(format!("temp basal rate {rate} U/h is too large")))?;
            let [hi, lo] = strokes.to_be_bytes();
            Ok([hi, lo, half_hours])
        });
        let params = self.record(params)?;
        self.execute(Opcode::SetAbsoluteTempBasal, &params).await.map(drop)
    }

    /// Start a percent temp basal.
    pub async fn set_percent_temp_basal(&mut self, percent: u8, minutes: u32) -> Result<(), MdtError> {
        let params = half_hours(minutes).and_then(|half_hours| {
            if percent > MAX_TEMP_BASAL_PERCENT {
                return Err(MdtError::InvalidParameter(format!("temp basal of {percent}%")));
            }
            Ok([percent, half_hours])
        });
        let params = self.record(params)?;
        self.execute(Opcode::SetPercentTempBasal, &params).await.map(drop)
    }

    /// Cancel a running temp basal: an absolute temp basal of zero for zero minutes.
    pub async fn cancel_temp_basal(&mut self) -> Result<(), MdtError> {
        self.execute(Opcode::SetAbsoluteTempBasal, &[0, 0, 0]).await.map(drop)
    }

    pub async fn suspend(&mut self) -> Result<(), MdtError> {
        self.execute(Opcode::Suspend, &[1]).await.map(drop)
    }

    pub async fn resume(&mut self) -> Result<(), MdtError> {
        self.execute(Opcode::Suspend, &[0]).await.map(drop)
    }

    pub async fn press_button(&mut self, button: Button) -> Result<(), MdtError> {
        self.execute(Opcode::Button, &[u8::from(button)]).await.map(drop)
    }

    /// Select standard (0), A (1) or B (2).
    pub async fn select_basal_pattern(&mut self, pattern: u8) -> Result<(), MdtError> {
        if pattern > 2 {
            return self.record(Err(MdtError::InvalidParameter(format!("basal pattern {pattern}"))));
        }
        self.execute(Opcode::SelectBasalPattern, &[pattern]).await.map(drop)
    }

    /// Search `band` for the strongest reply and retune to it.
    pub async fn tune(&mut self, band: SearchBand) -> Result<u32, MdtError> {
        self.check()?;
        let hz = ternary_search(self, band).await;
        let result = self.radio.set_frequency(hz);
        self.record(result)?;
        self.config.frequency = hz;
        info!("Tuned to {} Hz ({} dBm)", hz, self.last_rssi);
        Ok(hz)
    }
}

impl<R: RadioOps> RssiProbe for Session<R> {
    /// One model query at `hz`; no reply counts as no signal.
    async fn probe(&mut self, hz: u32) -> i32 {
        if self.radio.set_frequency(hz).is_err() {
            return NO_SIGNAL_DBM;
        }
        match self.exchange(Opcode::GetModel, &[], 1, self.config.timeout).await {
            Ok(_) => self.last_rssi,
            Err(_) => NO_SIGNAL_DBM,
        }
    }
}

/// Bolus amount as one byte of tenths (pre-23) or two big-endian stroke bytes.
fn bolus_params(amount: Insulin, family: Family) -> Result<Vec<u8>, MdtError> {
    let counts = amount.to_bolus_counts(family)?;
    let too_large = || MdtError::InvalidParameter(format!("bolus of {amount} U is too large"));
    if family.has_fine_strokes() {
        let strokes = u16::try_from(counts).map_err(|_| too_large())?;
        Ok(strokes.to_be_bytes().to_vec())
    } else {
        let tenths = u8::try_from(counts).map_err(|_| too_large())?;
        Ok(vec![tenths])
    }
}

/// Temp basal duration in half-hour units.
fn half_hours(minutes: u32) -> Result<u8, MdtError> {
    if minutes == 0 || minutes % 30 != 0 || minutes > MAX_TEMP_BASAL_MINUTES {
        return Err(MdtError::InvalidParameter(format!(
            "temp basal duration of {minutes} minutes"
        )));
    }
    Ok((minutes / 30) as u8)
}
