//! Data phase and FCP_RSP handling
//!
//! Inbound read data lands directly in the command buffer at its relative
//! offset. Writes go out in response to FCP_XFER_RDY, one sequence per
//! burst. A command completes only when the bytes moved match what the
//! response says should have moved; a response that arrives ahead of its
//! data gets a short grace period before recovery takes over.

use crate::command::{Command, CommandState, CompletionCode};
use crate::data::chunks;
use crate::initiator::FcpInitiator;
use fcp_codec::fcoe::{Eof, Sof};
use fcp_codec::fcp::{FcpRsp, FcpXferRdy};
use fcp_codec::{FCtl, FcFrame, FcHeader, FcType, RCtl};
use fcp_core::{DataDirection, FcError, FcResult, ScsiStatus, SlotHandle};

/// What a response plus the data seen so far add up to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settle {
    Complete(CompletionCode),
    /// Response is in, some data is still missing
    WaitForData,
    /// No response yet
    Pending,
}

/// Result of placing one read data frame
enum DataVerdict {
    BadCrc,
    /// Data beyond the end of the buffer; the exchange has to be aborted
    Overflow,
    Done(CompletionCode),
}

impl FcpInitiator {
    pub(crate) fn on_transfer_ready(&self, handle: SlotHandle, frame: &FcFrame) {
        let xfer = match FcpXferRdy::decode(&frame.payload) {
            Ok(xfer) => xfer,
            Err(e) => {
                log::warn!("bad FCP_XFER_RDY on {:#06x}: {}", frame.header.ox_id, e);
                return;
            }
        };
        let result = self
            .commands
            .with(handle, |c| self.send_data(c, xfer.offset, xfer.burst_len));
        match result {
            Some(Err(e)) => log::warn!(
                "write data for {:#06x} at {} not sent: {}",
                frame.header.ox_id,
                xfer.offset,
                e
            ),
            Some(Ok(sent)) => log::trace!(
                "sent {} bytes at {} on {:#06x}",
                sent,
                xfer.offset,
                frame.header.ox_id
            ),
            None => {}
        }
    }

    /// Send `[offset, offset + burst)` of the write buffer as one sequence.
    /// Runs under the command's slot lock.
    pub(crate) fn send_data(&self, c: &mut Command, offset: u32, burst: u32) -> FcResult<u32> {
        if c.direction() != DataDirection::Write {
            return Err(FcError::Protocol("transfer ready for a non-write".into()));
        }
        if c.abort_in_progress() {
            return Ok(0);
        }
        let end = offset.saturating_add(burst).min(c.data_len());
        if offset >= end {
            return Err(FcError::Protocol(format!(
                "transfer ready at {} outside {} bytes",
                offset,
                c.data_len()
            )));
        }
        if !c.transition(CommandState::AwaitingTransfer(DataDirection::Write)) {
            return Ok(0);
        }
        let (seq_id, seq_cnt) = self
            .exchanges
            .next_sequence(c.ox_id)
            .ok_or_else(|| FcError::Protocol(format!("exchange {:#06x} closed", c.ox_id)))?;

        let max = self.max_payload(&c.session);
        let s_id = self.local.port_id;
        let mut sent = 0;
        for (i, (off, len)) in chunks(offset, end, max).enumerate() {
            let first = i == 0;
            let last = off + len == end;
            let mut f_ctl = FCtl::REL_OFF;
            if last {
                f_ctl |= FCtl::END_SEQ | FCtl::SEQ_INIT;
            }
            let header = FcHeader::new(RCtl::SolData, FcType::Fcp, c.d_id(), s_id, f_ctl)
                .with_exchange(c.ox_id, c.rx_id)
                .with_sequence(seq_id, seq_cnt.wrapping_add(i as u16))
                .with_parameter(off);
            let payload = c.request.data.slice(off as usize..(off + len) as usize);
            let frame = FcFrame::new(header, payload)
                .with_delimiters(Sof::class3(first), Eof::class3(last));
            self.send_frame(frame)?;
            c.ranges.insert(off, len);
            sent += len;
        }
        Ok(sent)
    }

    pub(crate) fn on_solicited_data(&self, handle: SlotHandle, frame: &FcFrame) {
        let crc_ok = frame.crc_valid();
        let offset = frame
            .header
            .relative_offset()
            .unwrap_or(frame.header.parameter);
        let len = frame.payload.len() as u32;

        let verdict = self.commands.with(handle, |c| {
            if c.direction() != DataDirection::Read || c.abort_in_progress() {
                return None;
            }
            if !crc_ok {
                return Some(DataVerdict::BadCrc);
            }
            let end = offset as u64 + len as u64;
            if end > c.data_len() as u64 {
                log::warn!(
                    "{} bytes at {} overrun {}-byte read on {:#06x}",
                    len,
                    offset,
                    c.data_len(),
                    c.ox_id
                );
                return Some(DataVerdict::Overflow);
            }
            c.buffer[offset as usize..end as usize].copy_from_slice(&frame.payload);
            c.ranges.insert(offset, len);
            if c.state == CommandState::Issued {
                c.transition(CommandState::AwaitingTransfer(DataDirection::Read));
            }
            match settle(c) {
                Settle::Complete(code) => Some(DataVerdict::Done(code)),
                _ => None,
            }
        });

        match verdict.flatten() {
            Some(DataVerdict::BadCrc) => {
                self.stats.increment_crc_errors();
                log::warn!(
                    "CRC error in data at {} on {:#06x}",
                    offset,
                    frame.header.ox_id
                );
                self.abort_with(handle, CompletionCode::CrcError);
            }
            Some(DataVerdict::Overflow) => {
                self.abort_with(handle, CompletionCode::DataOverrun);
            }
            Some(DataVerdict::Done(code)) => {
                self.complete(handle, code);
            }
            None => {}
        }
    }

    pub(crate) fn on_status(&self, handle: SlotHandle, frame: &FcFrame) {
        let rsp = match FcpRsp::decode(&frame.payload) {
            Ok(rsp) => rsp,
            Err(e) => {
                log::warn!("bad FCP_RSP on {:#06x}: {}", frame.header.ox_id, e);
                return;
            }
        };
        let grace = self.config.grace_period();
        let verdict = self.commands.with(handle, |c| {
            if c.abort_in_progress() {
                return Settle::Pending;
            }
            c.rsp = Some(rsp);
            c.transition(CommandState::AwaitingStatus);
            let verdict = settle(c);
            if verdict == Settle::WaitForData {
                log::debug!(
                    "FCP_RSP on {:#06x} ahead of data: {} of {:?} bytes",
                    c.ox_id,
                    c.transferred(),
                    c.expected_len()
                );
                self.arm_timer(handle, c, grace);
            }
            verdict
        });
        if let Some(Settle::Complete(code)) = verdict {
            self.complete(handle, code);
        }
    }
}

/// Compare the bytes moved with what the response expects.
pub(crate) fn settle(c: &Command) -> Settle {
    let Some(rsp) = &c.rsp else {
        return Settle::Pending;
    };
    if rsp.is_overrun() {
        return Settle::Complete(CompletionCode::DataOverrun);
    }
    let expected = c.expected_len().unwrap_or_default();
    let moved = c.transferred();
    if moved == expected {
        Settle::Complete(CompletionCode::Ok)
    } else if moved > expected {
        Settle::Complete(CompletionCode::DataOverrun)
    } else if !matches!(rsp.status, ScsiStatus::Good | ScsiStatus::ConditionMet) {
        // A failed command may legitimately stop short of its residual.
        Settle::Complete(CompletionCode::Ok)
    } else {
        Settle::WaitForData
    }
}
