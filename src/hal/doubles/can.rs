use std::collections::VecDeque;

use crate::error::Error;
use crate::hal::can::{AcceptanceFilter, CanFrame, CanInterface, Mode};
use crate::hal::time::Milliseconds;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FakeCanError;

impl From<FakeCanError> for Error {
    fn from(_: FakeCanError) -> Self { Error::DriverError }
}

type Responder = Box<dyn FnMut(&CanFrame) -> Vec<CanFrame>>;

/// Scripted CAN controller. Frames queued on `rx` are handed out by
/// `receive`; transmitted frames are recorded in `sent` and optionally
/// fed to a responder closure standing in for the rest of the bus.
#[derive(Default)]
pub struct FakeCan {
    pub rx: VecDeque<CanFrame>,
    pub sent: Vec<CanFrame>,
    pub configurations: Vec<(u32, Mode, AcceptanceFilter)>,
    pub responder: Option<Responder>,
    /// Fail this many upcoming `configure` calls.
    pub configure_faults: usize,
    /// Fail this many upcoming `receive` calls.
    pub receive_faults: usize,
    /// Report a full transmit queue (send timeout).
    pub tx_full: bool,
}

impl FakeCan {
    pub fn new() -> Self { Self::default() }

    pub fn respond_with(&mut self, responder: Responder) { self.responder = Some(responder); }
}

impl CanInterface for FakeCan {
    type Error = FakeCanError;

    fn configure(
        &mut self,
        bit_rate: u32,
        mode: Mode,
        filter: AcceptanceFilter,
    ) -> Result<(), Self::Error> {
        self.configurations.push((bit_rate, mode, filter));
        if self.configure_faults > 0 {
            self.configure_faults -= 1;
            return Err(FakeCanError);
        }
        Ok(())
    }

    fn send(&mut self, frame: &CanFrame, _timeout: Milliseconds) -> Result<bool, Self::Error> {
        if self.tx_full {
            return Ok(false);
        }
        self.sent.push(*frame);
        if let Some(responder) = self.responder.as_mut() {
            let replies = responder(frame);
            self.rx.extend(replies);
        }
        Ok(true)
    }

    fn receive(&mut self, _timeout: Milliseconds) -> Result<Option<CanFrame>, Self::Error> {
        if self.receive_faults > 0 {
            self.receive_faults -= 1;
            return Err(FakeCanError);
        }
        Ok(self.rx.pop_front())
    }
}
