//! The FTP client half of the file transfer service
//!
//! Drives one transaction at a time against a remote server: each request
//! names the response it expects, and anything else, or silence past the
//! response timeout, ends the transaction. File data stages through an
//! internal buffer so transfers survive across ticks without borrowing
//! the requester's memory.

use defmt_or_log::debug;
use ecconet_common::{
    crc,
    files::{validate_file_name, FileName, PRODUCT_INFO_FILE},
    ftp::{BodyReader, RESPONSE_TIMEOUT_MS, SEGMENT_LEN},
    token::keys,
    Host, Token, TokenKey,
};

use crate::node::Services;
use crate::time::timer_expired;

/// Capacity of the client's staging buffer; transfers are capped here
pub const FTP_CLIENT_BUFFER_SIZE: usize = 1024;

/// How a finished transaction is reported to the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    /// The final response key, e.g.
    /// [`RESPONSE_FILE_READ_COMPLETE`](keys::RESPONSE_FILE_READ_COMPLETE)
    pub response_key: TokenKey,
    /// The server's CAN address
    pub server_address: u8,
    /// The access code used, or learned from a product info response
    pub server_access_code: u32,
    /// The server GUID, when a product info response carried it
    pub server_guid: [u32; 4],
    /// The file name
    pub file_name: FileName,
    /// The file timestamp reported by the server
    pub file_timestamp: u32,
    /// The file data size reported by the server
    pub file_size: u32,
    /// The file data checksum reported by the server
    pub file_checksum: u16,
}

/// What the open transaction is doing with the staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    None,
    Read,
    Write,
}

#[derive(Debug)]
pub(crate) struct FtpClient {
    server_address: u8,
    server_access_code: u32,
    server_guid: [u32; 4],
    /// The response that continues the transaction, or null when idle
    expected_response: TokenKey,
    response_deadline: u32,
    file_name: FileName,
    file_size: u32,
    file_checksum: u16,
    file_timestamp: u32,
    segment_index: u16,
    direction: Direction,
    buffer: [u8; FTP_CLIENT_BUFFER_SIZE],
    buffer_len: usize,
}

impl FtpClient {
    pub fn new() -> Self {
        FtpClient {
            server_address: 0,
            server_access_code: 0,
            server_guid: [0; 4],
            expected_response: keys::NULL,
            response_deadline: 0,
            file_name: FileName::new(),
            file_size: 0,
            file_checksum: 0,
            file_timestamp: 0,
            segment_index: 0,
            direction: Direction::None,
            buffer: [0; FTP_CLIENT_BUFFER_SIZE],
            buffer_len: 0,
        }
    }

    pub fn reset(&mut self, now: u32) {
        self.expected_response = keys::NULL;
        self.direction = Direction::None;
        self.response_deadline = now.wrapping_add(RESPONSE_TIMEOUT_MS);
    }

    /// Whether a transaction is open
    pub fn is_busy(&self) -> bool {
        self.expected_response != keys::NULL
    }

    /// Data read by the last completed transfer
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.buffer_len]
    }

    /// Time out a transaction whose server went quiet.
    pub fn clock<H: Host>(&mut self, services: &mut Services<'_, H>) -> Option<TransferInfo> {
        if !timer_expired(services.now, self.response_deadline) {
            return None;
        }
        self.response_deadline = services.now.wrapping_add(RESPONSE_TIMEOUT_MS);
        if self.expected_response == keys::NULL {
            return None;
        }
        debug!("ftp transaction with {} timed out", self.server_address);
        self.expected_response = keys::NULL;
        self.direction = Direction::None;
        Some(self.transfer_info(keys::RESPONSE_FTP_TRANSACTION_TIMED_OUT))
    }

    /// Start a file info request. `server_busy` reports whether our own
    /// FTP server holds a transaction.
    pub fn get_file_info<H: Host>(
        &mut self,
        server: u8,
        access_code: u32,
        name: &str,
        server_busy: bool,
        services: &mut Services<'_, H>,
    ) -> Result<(), StartError> {
        self.check_ready(server, server_busy)?;
        let name = FileName::try_from(name).map_err(|()| StartError::InvalidFileName)?;
        if validate_file_name(&name).is_none() {
            return Err(StartError::InvalidFileName);
        }

        self.begin(server, access_code, name, Direction::None);
        services.start_message(server);
        services.tx.add_u16(keys::REQUEST_FILE_INFO.raw());
        services.tx.add_str(&self.file_name);
        services.tx.add_u32(access_code);
        self.finish_request(keys::RESPONSE_FILE_INFO, services);
        Ok(())
    }

    /// Start an indexed file info request.
    pub fn get_indexed_file_info<H: Host>(
        &mut self,
        server: u8,
        access_code: u32,
        volume: u16,
        file_index: u32,
        server_busy: bool,
        services: &mut Services<'_, H>,
    ) -> Result<(), StartError> {
        self.check_ready(server, server_busy)?;
        self.begin(server, access_code, FileName::new(), Direction::None);
        services.start_message(server);
        services.tx.add_u16(keys::REQUEST_FILE_INDEXED_INFO.raw());
        services.tx.add_u16(volume);
        services.tx.add_u32(file_index);
        services.tx.add_u32(access_code);
        self.finish_request(keys::RESPONSE_FILE_INDEXED_INFO, services);
        Ok(())
    }

    /// Start reading a file into the staging buffer.
    pub fn read_file<H: Host>(
        &mut self,
        server: u8,
        access_code: u32,
        name: &str,
        server_busy: bool,
        services: &mut Services<'_, H>,
    ) -> Result<(), StartError> {
        self.check_ready(server, server_busy)?;
        let name = FileName::try_from(name).map_err(|()| StartError::InvalidFileName)?;
        if validate_file_name(&name).is_none() {
            return Err(StartError::InvalidFileName);
        }

        self.begin(server, access_code, name, Direction::Read);
        services.start_message(server);
        services.tx.add_u16(keys::REQUEST_FILE_READ_START.raw());
        services.tx.add_str(&self.file_name);
        services.tx.add_u32(access_code);
        self.finish_request(keys::RESPONSE_FILE_READ_START, services);
        Ok(())
    }

    /// Start writing `data` to the server.
    pub fn write_file<H: Host>(
        &mut self,
        server: u8,
        access_code: u32,
        name: &str,
        data: &[u8],
        timestamp: u32,
        server_busy: bool,
        services: &mut Services<'_, H>,
    ) -> Result<(), StartError> {
        self.check_ready(server, server_busy)?;
        let name = FileName::try_from(name).map_err(|()| StartError::InvalidFileName)?;
        if validate_file_name(&name).is_none() {
            return Err(StartError::InvalidFileName);
        }
        if data.is_empty() {
            return Err(StartError::NoData);
        }
        if data.len() > FTP_CLIENT_BUFFER_SIZE {
            return Err(StartError::TooLarge);
        }

        self.begin(server, access_code, name, Direction::Write);
        self.buffer[..data.len()].copy_from_slice(data);
        self.buffer_len = data.len();
        self.file_size = data.len() as u32;
        self.file_timestamp = timestamp;

        services.start_message(server);
        services.tx.add_u16(keys::REQUEST_FILE_WRITE_START.raw());
        services.tx.add_str(&self.file_name);
        services.tx.add_u32(data.len() as u32);
        services.tx.add_u16(crc::crc16(data));
        services.tx.add_u32(timestamp);
        services.tx.add_u32(access_code);
        self.finish_request(keys::RESPONSE_FILE_WRITE_START, services);
        Ok(())
    }

    /// Ask the server to delete a file.
    pub fn delete_file<H: Host>(
        &mut self,
        server: u8,
        access_code: u32,
        name: &str,
        server_busy: bool,
        services: &mut Services<'_, H>,
    ) -> Result<(), StartError> {
        self.check_ready(server, server_busy)?;
        let name = FileName::try_from(name).map_err(|()| StartError::InvalidFileName)?;
        if validate_file_name(&name).is_none() {
            return Err(StartError::InvalidFileName);
        }

        self.begin(server, access_code, name, Direction::None);
        services.start_message(server);
        services.tx.add_u16(keys::REQUEST_FILE_DELETE.raw());
        services.tx.add_str(&self.file_name);
        services.tx.add_u32(access_code);
        self.finish_request(keys::RESPONSE_FILE_DELETE, services);
        Ok(())
    }

    /// Dispatch a server response. Returns the completion report when the
    /// transaction ends.
    pub fn response_in<H: Host>(
        &mut self,
        sender: u8,
        response: TokenKey,
        body: &[u8],
        services: &mut Services<'_, H>,
    ) -> Option<TransferInfo> {
        // idle, or a response from somebody we are not talking to
        if self.expected_response == keys::NULL || sender != self.server_address {
            return None;
        }
        if response != self.expected_response {
            return Some(self.end_transaction(response, services));
        }

        match response {
            keys::RESPONSE_FILE_INDEXED_INFO
            | keys::RESPONSE_FILE_INFO
            | keys::RESPONSE_FILE_READ_START => {
                self.handle_info_or_read_start(response, body, services)
            }
            keys::RESPONSE_FILE_READ_SEGMENT => self.handle_read_segment(body, services),
            keys::RESPONSE_FILE_WRITE_START => self.handle_write_start(body, services),
            keys::RESPONSE_FILE_WRITE_SEGMENT => self.handle_write_segment(body, services),
            keys::RESPONSE_FILE_DELETE => self.handle_delete(body, services),
            other => Some(self.end_transaction(other, services)),
        }
    }

    fn check_ready(&self, server: u8, server_busy: bool) -> Result<(), StartError> {
        if server_busy || self.is_busy() {
            return Err(StartError::Busy);
        }
        if server == 0 {
            return Err(StartError::InvalidServer);
        }
        Ok(())
    }

    fn begin(&mut self, server: u8, access_code: u32, name: FileName, direction: Direction) {
        self.server_address = server;
        self.server_access_code = access_code;
        self.file_name = name;
        self.file_size = 0;
        self.file_checksum = 0;
        self.file_timestamp = 0;
        self.segment_index = 0;
        self.buffer_len = 0;
        self.direction = direction;
    }

    /// Arm the response timer and point the receiver at the server.
    fn finish_request<H: Host>(&mut self, expected: TokenKey, services: &mut Services<'_, H>) {
        services.tx.finish_message();
        self.expected_response = expected;
        self.response_deadline = services.now.wrapping_add(RESPONSE_TIMEOUT_MS);
        services.set_sender_filter(self.server_address);
    }

    /// Close out the transaction, releasing the server's slot.
    fn end_transaction<H: Host>(
        &mut self,
        response: TokenKey,
        services: &mut Services<'_, H>,
    ) -> TransferInfo {
        self.expected_response = keys::NULL;
        services.set_sender_filter(0);
        services.send_token(&Token::new(
            self.server_address,
            keys::REQUEST_FILE_TRANSFER_COMPLETE,
            0,
        ));
        self.transfer_info(response)
    }

    fn transfer_info(&self, response: TokenKey) -> TransferInfo {
        TransferInfo {
            response_key: response,
            server_address: self.server_address,
            server_access_code: self.server_access_code,
            server_guid: self.server_guid,
            file_name: self.file_name.clone(),
            file_timestamp: self.file_timestamp,
            file_size: self.file_size,
            file_checksum: self.file_checksum,
        }
    }

    fn request_read_segment<H: Host>(&mut self, services: &mut Services<'_, H>) {
        services.start_message(self.server_address);
        services.tx.add_u16(keys::REQUEST_FILE_READ_SEGMENT.raw());
        services.tx.add_u16(self.segment_index);
        services.tx.add_u32(self.server_access_code);
        self.finish_request(keys::RESPONSE_FILE_READ_SEGMENT, services);
    }

    fn handle_info_or_read_start<H: Host>(
        &mut self,
        response: TokenKey,
        body: &[u8],
        services: &mut Services<'_, H>,
    ) -> Option<TransferInfo> {
        let mut reader = BodyReader::new(body);
        let Ok(name) = reader.file_name() else {
            return Some(self.end_transaction(keys::RESPONSE_FTP_SERVER_ERROR, services));
        };

        if response == keys::RESPONSE_FILE_INDEXED_INFO {
            self.file_name = FileName::try_from(name).unwrap_or_default();
        } else if self.file_name.as_str() != name {
            return Some(self.end_transaction(keys::RESPONSE_FTP_SERVER_ERROR, services));
        }

        let parsed = match (reader.u32(), reader.u16(), reader.u32()) {
            (Ok(size), Ok(checksum), Ok(timestamp)) => (size, checksum, timestamp),
            _ => return Some(self.end_transaction(keys::RESPONSE_FTP_SERVER_ERROR, services)),
        };
        (self.file_size, self.file_checksum, self.file_timestamp) = parsed;

        // a product info response appends the GUID, from which the
        // server's access code follows
        if response == keys::RESPONSE_FILE_INFO
            && self.file_name.as_str() == PRODUCT_INFO_FILE
            && reader.remaining().len() >= 16
        {
            let mut guid_reader = reader;
            for word in &mut self.server_guid {
                *word = guid_reader.u32().unwrap_or(0);
            }
            self.server_access_code = ecconet_common::ftp::access_code(&self.server_guid);
        }

        // a zero size is how the server reports an absent file here
        if self.file_size == 0 {
            return Some(self.end_transaction(keys::RESPONSE_FILE_NOT_FOUND, services));
        }

        if response != keys::RESPONSE_FILE_READ_START || self.direction != Direction::Read {
            return Some(self.end_transaction(keys::RESPONSE_FILE_INFO_COMPLETE, services));
        }

        self.segment_index = 0;
        self.request_read_segment(services);
        None
    }

    fn handle_read_segment<H: Host>(
        &mut self,
        body: &[u8],
        services: &mut Services<'_, H>,
    ) -> Option<TransferInfo> {
        let mut reader = BodyReader::new(body);
        let Ok(segment) = reader.u16() else {
            return Some(self.end_transaction(keys::RESPONSE_FTP_SERVER_ERROR, services));
        };
        if segment != self.segment_index {
            return Some(self.end_transaction(keys::RESPONSE_FTP_SERVER_ERROR, services));
        }

        let data = reader.remaining();
        let offset = segment as usize * SEGMENT_LEN;
        let remaining_file = (self.file_size as usize).saturating_sub(offset);
        let remaining_buffer = FTP_CLIENT_BUFFER_SIZE.saturating_sub(offset);
        let copy = data.len().min(remaining_file).min(remaining_buffer);
        self.buffer[offset..offset + copy].copy_from_slice(&data[..copy]);
        self.buffer_len = offset + copy;

        let next_offset = offset + SEGMENT_LEN;
        if next_offset >= self.file_size as usize || next_offset >= FTP_CLIENT_BUFFER_SIZE {
            // file complete (or buffer full); verify against the stored
            // checksum
            let verdict = if crc::crc16(self.data()) == self.file_checksum {
                keys::RESPONSE_FILE_READ_COMPLETE
            } else {
                keys::RESPONSE_FILE_CHECKSUM_ERROR
            };
            return Some(self.end_transaction(verdict, services));
        }

        self.segment_index += 1;
        self.request_read_segment(services);
        None
    }

    fn request_write_segment<H: Host>(
        &mut self,
        services: &mut Services<'_, H>,
    ) -> Option<TransferInfo> {
        let offset = self.segment_index as usize * SEGMENT_LEN;
        if offset >= self.buffer_len {
            return Some(self.end_transaction(keys::RESPONSE_FILE_WRITE_COMPLETE, services));
        }
        let len = SEGMENT_LEN.min(self.buffer_len - offset);

        services.start_message(self.server_address);
        services.tx.add_u16(keys::REQUEST_FILE_WRITE_SEGMENT.raw());
        services.tx.add_u16(self.segment_index);
        services.tx.add_u32(self.server_access_code);
        for i in offset..offset + len {
            let byte = self.buffer[i];
            services.tx.add_byte(byte);
        }
        self.finish_request(keys::RESPONSE_FILE_WRITE_SEGMENT, services);
        None
    }

    fn handle_write_start<H: Host>(
        &mut self,
        body: &[u8],
        services: &mut Services<'_, H>,
    ) -> Option<TransferInfo> {
        let mut reader = BodyReader::new(body);
        match reader.file_name() {
            Ok(name) if name == self.file_name.as_str() => {}
            _ => return Some(self.end_transaction(keys::RESPONSE_FTP_SERVER_ERROR, services)),
        }
        self.segment_index = 0;
        self.request_write_segment(services)
    }

    fn handle_write_segment<H: Host>(
        &mut self,
        body: &[u8],
        services: &mut Services<'_, H>,
    ) -> Option<TransferInfo> {
        let mut reader = BodyReader::new(body);
        let Ok(segment) = reader.u16() else {
            return Some(self.end_transaction(keys::RESPONSE_FTP_SERVER_ERROR, services));
        };
        if segment != self.segment_index {
            return Some(self.end_transaction(keys::RESPONSE_FTP_SERVER_ERROR, services));
        }
        self.segment_index += 1;
        self.request_write_segment(services)
    }

    fn handle_delete<H: Host>(
        &mut self,
        body: &[u8],
        services: &mut Services<'_, H>,
    ) -> Option<TransferInfo> {
        let mut reader = BodyReader::new(body);
        match reader.file_name() {
            Ok(name) if name == self.file_name.as_str() => {}
            _ => return Some(self.end_transaction(keys::RESPONSE_FTP_SERVER_ERROR, services)),
        }
        Some(self.end_transaction(keys::RESPONSE_FILE_DELETE_COMPLETE, services))
    }
}

/// Why a transfer could not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    /// A transaction is already open, ours or the server's
    Busy,
    /// The server address is not a device address
    InvalidServer,
    /// The file name is not a valid 8.3 name
    InvalidFileName,
    /// A write needs data
    NoData,
    /// The data exceeds the staging buffer
    TooLarge,
}
