//! Test support: a scripted control bus standing in for the USB transport.

use std::cell::RefCell;
use std::time::Duration;

use crate::error::Result;
use crate::usb::ControlBus;

/// One recorded host-to-device control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ControlWrite {
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

pub(crate) type ReadHandler = Box<dyn FnMut(u8, u16, u16, &mut [u8]) -> Result<usize>>;
pub(crate) type WriteHook = Box<dyn FnMut(&ControlWrite)>;

/// A `ControlBus` that records writes and scripts reads.
pub(crate) struct MockBus {
    pub writes: RefCell<Vec<ControlWrite>>,
    read_handler: RefCell<Option<ReadHandler>>,
    write_hook: RefCell<Option<WriteHook>>,
}

impl MockBus {
    pub fn new() -> MockBus {
        MockBus {
            writes: RefCell::new(Vec::new()),
            read_handler: RefCell::new(None),
            write_hook: RefCell::new(None),
        }
    }

    /// Script inbound transfers. Without a handler, reads return zeroes.
    pub fn on_read<F>(self, handler: F) -> Self
    where
        F: FnMut(u8, u16, u16, &mut [u8]) -> Result<usize> + 'static,
    {
        *self.read_handler.borrow_mut() = Some(Box::new(handler));
        self
    }

    /// Observe outbound transfers as they happen (they are recorded either
    /// way).
    pub fn on_write<F>(self, hook: F) -> Self
    where
        F: FnMut(&ControlWrite) + 'static,
    {
        *self.write_hook.borrow_mut() = Some(Box::new(hook));
        self
    }

    pub fn writes(&self) -> Vec<ControlWrite> {
        self.writes.borrow().clone()
    }
}

impl ControlBus for MockBus {
    fn control_write(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let write = ControlWrite {
            request,
            value,
            index,
            data: data.to_vec(),
        };
        if let Some(hook) = self.write_hook.borrow_mut().as_mut() {
            hook(&write);
        }
        self.writes.borrow_mut().push(write);
        Ok(data.len())
    }

    fn control_read(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        match self.read_handler.borrow_mut().as_mut() {
            Some(handler) => handler(request, value, index, data),
            None => {
                data.fill(0);
                Ok(data.len())
            }
        }
    }
}
