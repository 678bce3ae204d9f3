// Licensed under the Apache-2.0 license

use crate::error::{ProtocolError, UsbI3cError, UsbI3cResult, ValidationError};
use crate::request_tracker::{RegularRequest, RequestTracker, ResponseCallback};
use crate::transport::UsbTransport;
use log::{debug, warn};
use usbi3c_common::codec::{read_record, UsbI3cCodec};
use usbi3c_common::message::bulk::{BulkRequest, CommandBlock, CommandDescriptor};
use usbi3c_common::protocol::command::{
    CommandType, ErrorHandling, I3cMode, CCC_RSTACT_BROADCAST, CCC_RSTACT_DIRECT,
    I3C_BROADCAST_ADDRESS, MAX_TARGET_ADDRESS,
};
use usbi3c_common::protocol::requests::{ClassRequest, BUFFER_AVAILABLE_LEN};
use zerocopy::byteorder::{LittleEndian, U32};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Write(Vec<u8>),
    /// Number of bytes to read; a multiple of 4.
    Read(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Regular,
    Ccc(u8),
    CccWithDefiningByte { ccc: u8, defining_byte: u8 },
    TargetResetPattern,
}

impl CommandKind {
    fn command_type(&self) -> CommandType {
        match self {
            CommandKind::Regular => CommandType::Regular,
            CommandKind::Ccc(_) => CommandType::CccWithoutDefiningByte,
            CommandKind::CccWithDefiningByte { .. } => CommandType::CccWithDefiningByte,
            CommandKind::TargetResetPattern => CommandType::TargetResetPattern,
        }
    }

    fn ccc(&self) -> Option<u8> {
        match self {
            CommandKind::Ccc(ccc) | CommandKind::CccWithDefiningByte { ccc, .. } => Some(*ccc),
            _ => None,
        }
    }
}

/// Whether the first command of a batch waits for the previous batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    NotDependentOnPrevious,
    DependentOnPrevious,
}

pub struct Command {
    pub target_address: u8,
    pub transfer: Transfer,
    pub error_handling: ErrorHandling,
    pub kind: CommandKind,
    pub mode: I3cMode,
    callback: Option<ResponseCallback>,
}

impl core::fmt::Debug for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Command")
            .field("target_address", &self.target_address)
            .field("transfer", &self.transfer)
            .field("error_handling", &self.error_handling)
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl Command {
    pub fn new(
        kind: CommandKind,
        target_address: u8,
        transfer: Transfer,
        error_handling: ErrorHandling,
    ) -> Self {
        Self {
            target_address,
            transfer,
            error_handling,
            kind,
            mode: I3cMode::default(),
            callback: None,
        }
    }

    /// Target reset pattern, always broadcast and without payload.
    pub fn target_reset_pattern() -> Self {
        Self::new(
            CommandKind::TargetResetPattern,
            I3C_BROADCAST_ADDRESS,
            Transfer::Write(Vec::new()),
            ErrorHandling::default(),
        )
    }

    pub fn with_mode(mut self, mode: I3cMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_callback(mut self, callback: ResponseCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.target_address > MAX_TARGET_ADDRESS {
            return Err(ValidationError::AddressOutOfRange(self.target_address));
        }
        match &self.transfer {
            Transfer::Write(data) => {
                if data.is_empty() && self.kind == CommandKind::Regular {
                    return Err(ValidationError::MissingWriteData);
                }
                if u32::try_from(data.len()).is_err() {
                    return Err(ValidationError::PayloadTooLarge(data.len()));
                }
            }
            Transfer::Read(len) => {
                if len % 4 != 0 {
                    return Err(ValidationError::UnalignedReadLength(*len));
                }
                if *len == 0 && self.kind == CommandKind::Regular {
                    return Err(ValidationError::ZeroReadLength);
                }
            }
        }
        Ok(())
    }

    /// A command after which a target reset pattern may be queued.
    fn allows_reset_pattern_after(&self) -> bool {
        match self.kind {
            CommandKind::TargetResetPattern => true,
            _ => {
                matches!(
                    self.kind.ccc(),
                    Some(CCC_RSTACT_BROADCAST) | Some(CCC_RSTACT_DIRECT)
                ) && self.error_handling == ErrorHandling::DoNotTerminateIncludingNack
            }
        }
    }

    fn descriptor(&self) -> CommandDescriptor {
        let (read, data_length) = match &self.transfer {
            Transfer::Write(data) => (false, data.len() as u32),
            Transfer::Read(len) => (true, *len),
        };
        let (ccc, defining_byte) = match self.kind {
            CommandKind::Ccc(ccc) => (ccc, 0),
            CommandKind::CccWithDefiningByte { ccc, defining_byte } => (ccc, defining_byte),
            _ => (0, 0),
        };
        CommandDescriptor::new(
            self.kind.command_type(),
            read,
            self.error_handling,
            self.target_address,
            self.mode.transfer_mode,
            self.mode.transfer_rate,
            self.mode.tm_specific_info,
            ccc,
            defining_byte,
            data_length,
        )
    }

    fn block(&self, request_id: u16, dependent_on_previous: bool) -> CommandBlock {
        let data = match &self.transfer {
            Transfer::Write(data) => data.clone(),
            Transfer::Read(_) => Vec::new(),
        };
        CommandBlock {
            request_id,
            dependent_on_previous,
            descriptor: self.descriptor(),
            data,
        }
    }
}

/// Reads the free space of the device's bulk request buffer.
pub fn query_buffer_available(transport: &impl UsbTransport) -> UsbI3cResult<usize> {
    let data = transport.control_in(ClassRequest::GetBufferAvailable, 0, BUFFER_AVAILABLE_LEN)?;
    let available: U32<LittleEndian> = read_record(&data, 0)?;
    Ok(available.get() as usize)
}

/// Refuses a bulk request the device has no room for.
pub fn ensure_buffer_available(transport: &impl UsbTransport, required: usize) -> UsbI3cResult<()> {
    let available = query_buffer_available(transport)?;
    if required > available {
        return Err(UsbI3cError::BufferUnavailable {
            required,
            available,
        });
    }
    Ok(())
}

/// Writes `bytes` as one bulk OUT transfer; a short write is an error.
pub fn write_bulk_request(transport: &impl UsbTransport, bytes: &[u8]) -> UsbI3cResult<()> {
    let written = transport.bulk_out(bytes)?;
    if written != bytes.len() {
        return Err(ProtocolError::ShortTransfer {
            expected: bytes.len(),
            actual: written,
        }
        .into());
    }
    Ok(())
}

/// Commands waiting to be sent as one bulk request.
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: Vec<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `command` and appends it. Nothing is sent.
    pub fn push(&mut self, command: Command) -> UsbI3cResult<()> {
        command.validate()?;
        if command.kind == CommandKind::TargetResetPattern {
            let placement_ok = self
                .commands
                .last()
                .map_or(true, Command::allows_reset_pattern_after);
            if !placement_ok {
                return Err(ValidationError::MisplacedResetPattern.into());
            }
        }
        self.commands.push(command);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Encodes the queue as one regular bulk request. The first command takes
    /// its dependency from `dependency`; the rest always depend on the one
    /// before them.
    pub fn build_request(&self, first_request_id: u16, dependency: Dependency) -> BulkRequest {
        BulkRequest::Regular(self.blocks(first_request_id, dependency))
    }

    fn blocks(&self, first_request_id: u16, dependency: Dependency) -> Vec<CommandBlock> {
        self.commands
            .iter()
            .enumerate()
            .map(|(i, command)| {
                let dependent = i > 0 || dependency == Dependency::DependentOnPrevious;
                command.block(first_request_id.wrapping_add(i as u16), dependent)
            })
            .collect()
    }

    /// Sends the queued commands as a single bulk request and tracks them.
    ///
    /// The caller must hold the queue exclusively for the whole call; that is
    /// what serializes request identifiers between submitters. Requests are
    /// tracked before the OUT transfer so a fast response always finds them.
    /// On failure nothing stays tracked and the queue is left as it was.
    ///
    /// Returns the request identifiers in queue order.
    pub fn submit(
        &mut self,
        transport: &impl UsbTransport,
        tracker: &RequestTracker,
        dependency: Dependency,
    ) -> UsbI3cResult<Vec<u16>> {
        if self.commands.is_empty() {
            return Err(ValidationError::EmptyQueue.into());
        }
        if let Some(index) = self.commands.iter().position(|c| !c.has_callback()) {
            return Err(ValidationError::MissingCallback(index).into());
        }

        tracker.ensure_receiving()?;

        let first_request_id = tracker.next_request_id();
        let blocks = self.blocks(first_request_id, dependency);
        // Tracked flags come from the same blocks that go on the wire.
        let headers: Vec<(u16, bool)> = blocks
            .iter()
            .map(|b| (b.request_id, b.dependent_on_previous))
            .collect();
        let bytes = BulkRequest::Regular(blocks).to_bytes()?;
        ensure_buffer_available(transport, bytes.len())?;

        let request_ids: Vec<u16> = headers.iter().map(|(id, _)| *id).collect();
        let mut tracked = Vec::with_capacity(self.commands.len());
        for (command, (request_id, dependent)) in self.commands.iter_mut().zip(headers) {
            if let Some(callback) = command.callback.take() {
                tracked.push(RegularRequest::new(request_id, dependent, callback));
            }
        }
        tracker.track(tracked);

        if let Err(err) = write_bulk_request(transport, &bytes) {
            warn!("Bulk request {:?} not sent: {}", request_ids, err);
            for request in tracker.withdraw(&request_ids) {
                let index = request.request_id.wrapping_sub(first_request_id) as usize;
                if let Some(command) = self.commands.get_mut(index) {
                    command.callback = Some(request.callback);
                }
            }
            return Err(err);
        }

        tracker.advance_request_id(request_ids.len());
        self.commands.clear();
        debug!(
            "Submitted {} commands, request ids {:?}",
            request_ids.len(),
            request_ids
        );
        Ok(request_ids)
    }
}
