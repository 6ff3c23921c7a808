//! The FTP server half of the file transfer service
//!
//! Serves file info, reads, writes, and deletes to one client at a time
//! over the ordinary token message layer. Mutating requests are gated by
//! the GUID-derived access code. While a transaction is open the receiver
//! accepts multi-frame traffic only from the active client, and a stalled
//! transaction resets itself after the response timeout.

use defmt_or_log::{debug, warn};
use ecconet_common::{
    files::{FileMetadata, FileName, PRODUCT_INFO_FILE},
    ftp::{self, BodyReader, RESPONSE_TIMEOUT_MS, SEGMENT_LEN},
    token::keys,
    Host, ReadHandling, Token, TokenKey,
};

use crate::node::Services;
use crate::storage;
use crate::time::timer_expired;

#[derive(Debug)]
pub(crate) struct FtpServer {
    client_address: u8,
    /// The open request, or the null key when idle
    request: TokenKey,
    request_deadline: u32,
    file: FileMetadata,
    access_code: u32,
}

impl FtpServer {
    pub fn new() -> Self {
        FtpServer {
            client_address: 0,
            request: keys::NULL,
            request_deadline: 0,
            file: FileMetadata::default(),
            access_code: 0,
        }
    }

    pub fn reset<H: Host>(&mut self, services: &mut Services<'_, H>) {
        self.request = keys::NULL;
        self.access_code = ftp::access_code(&services.host.guid());
        self.request_deadline = services.now.wrapping_add(RESPONSE_TIMEOUT_MS);
    }

    /// Whether a client transaction is open
    pub fn is_busy(&self) -> bool {
        self.request != keys::NULL
    }

    /// Drop a transaction whose client went quiet.
    pub fn clock<H: Host>(&mut self, services: &mut Services<'_, H>) {
        if timer_expired(services.now, self.request_deadline) {
            self.request_deadline = services.now.wrapping_add(RESPONSE_TIMEOUT_MS);
            if self.request != keys::NULL {
                debug!("ftp transaction with {} timed out", self.client_address);
                self.request = keys::NULL;
            }
        }
    }

    /// Handle one client request.
    ///
    /// `client_busy` reports whether our own FTP client holds a
    /// transaction; a node acts as client or server, never both.
    pub fn request_in<H: Host>(
        &mut self,
        sender: u8,
        request: TokenKey,
        body: &[u8],
        client_busy: bool,
        services: &mut Services<'_, H>,
    ) {
        if client_busy {
            return;
        }

        // an open transaction rejects new transfer starts and other clients
        if self.request != keys::NULL
            && (request == keys::REQUEST_FILE_READ_START
                || request == keys::REQUEST_FILE_WRITE_START
                || sender != self.client_address)
        {
            services.send_token(&Token::new(sender, keys::RESPONSE_FTP_SERVER_BUSY, 0));
            return;
        }

        self.request = request;
        self.client_address = sender;
        self.request_deadline = services.now.wrapping_add(RESPONSE_TIMEOUT_MS);
        services.set_sender_filter(self.client_address);

        match request {
            keys::REQUEST_FILE_INDEXED_INFO
            | keys::REQUEST_FILE_INFO
            | keys::REQUEST_FILE_READ_START => {
                self.handle_info_or_read_start(sender, request, body, services);
            }
            keys::REQUEST_FILE_READ_SEGMENT => self.handle_read_segment(body, services),
            keys::REQUEST_FILE_WRITE_START => self.handle_write_start(body, services),
            keys::REQUEST_FILE_WRITE_SEGMENT => self.handle_write_segment(body, services),
            keys::REQUEST_FILE_DELETE => self.handle_delete(body, services),
            keys::REQUEST_FILE_TRANSFER_COMPLETE => {
                self.request = keys::NULL;
                services.set_sender_filter(0);
            }
            _ => {}
        }
    }

    /// Clear the transaction and tell the client why.
    fn refuse<H: Host>(&mut self, response: TokenKey, services: &mut Services<'_, H>) {
        let client = self.client_address;
        self.request = keys::NULL;
        services.set_sender_filter(0);
        services.send_token(&Token::new(client, response, 0));
    }

    fn code_is_valid(&self, code: u32) -> bool {
        code == self.access_code
    }

    fn handle_info_or_read_start<H: Host>(
        &mut self,
        sender: u8,
        request: TokenKey,
        body: &[u8],
        services: &mut Services<'_, H>,
    ) {
        self.file = FileMetadata::default();
        let mut reader = BodyReader::new(body);
        let mut sending_guid = false;

        if request == keys::REQUEST_FILE_INDEXED_INFO {
            let (volume, file_index, code) =
                match (reader.u16(), reader.u32(), reader.code()) {
                    (Ok(v), Ok(i), Ok(c)) => (v, i, c),
                    _ => return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services),
                };
            if !self.code_is_valid(code) {
                return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services);
            }
            match storage::file_by_index(services.host, volume, file_index) {
                Ok(meta) => self.file = meta,
                Err(_) => return self.refuse(keys::RESPONSE_FILE_NOT_FOUND, services),
            }
        } else {
            let Ok(name) = reader.file_name() else {
                return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services);
            };
            self.file.name = FileName::try_from(name).unwrap_or_default();

            // a product info request needs no access code; the info
            // response is how clients learn the GUID in the first place
            sending_guid = request == keys::REQUEST_FILE_INFO
                && self.file.name.as_str() == PRODUCT_INFO_FILE;
            if !sending_guid {
                match reader.code() {
                    Ok(code) if self.code_is_valid(code) => {}
                    _ => return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services),
                }
            }

            self.file.volume = services.host.file_to_volume(&self.file.name);

            if services.host.ftp_read_handler(sender, &mut self.file) == ReadHandling::Override {
                // the application supplied the data; checksum it ourselves
                let checksum = data_checksum(services.host, &self.file);
                self.file.checksum = checksum;
            } else if let Ok(meta) =
                storage::find_file(services.host, self.file.volume, &self.file.name)
            {
                self.file = meta;
            } else if sending_guid {
                // no stored product record; a placeholder still carries
                // the GUID
                self.file.size = 1;
            } else {
                return self.refuse(keys::RESPONSE_FILE_NOT_FOUND, services);
            }
        }

        let response = match request {
            keys::REQUEST_FILE_INDEXED_INFO => keys::RESPONSE_FILE_INDEXED_INFO,
            keys::REQUEST_FILE_INFO => keys::RESPONSE_FILE_INFO,
            _ => keys::RESPONSE_FILE_READ_START,
        };

        services.start_message(self.client_address);
        services.tx.add_u16(response.raw());
        services.tx.add_str(&self.file.name);
        services.tx.add_u32(self.file.size);
        services.tx.add_u16(self.file.checksum);
        services.tx.add_u32(self.file.timestamp);
        if sending_guid {
            for word in services.host.guid() {
                services.tx.add_u32(word);
            }
        }
        services.tx.finish_message();
    }

    fn handle_read_segment<H: Host>(&mut self, body: &[u8], services: &mut Services<'_, H>) {
        if self.file.size == 0 {
            return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services);
        }
        let mut reader = BodyReader::new(body);
        let (segment, code) = match (reader.u16(), reader.code()) {
            (Ok(s), Ok(c)) => (s, c),
            _ => return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services),
        };
        if !self.code_is_valid(code) {
            return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services);
        }

        services.start_message(self.client_address);
        services.tx.add_u16(keys::RESPONSE_FILE_READ_SEGMENT.raw());
        services.tx.add_u16(segment);

        // stream the segment through a small window; the final segment
        // may fall short
        let mut offset = segment as u32 * SEGMENT_LEN as u32;
        let end = self.file.size.min(offset + SEGMENT_LEN as u32);
        let mut buf = [0u8; 16];
        while offset < end {
            let len = buf.len().min((end - offset) as usize);
            if storage::read_data(services.host, &self.file, offset, &mut buf[..len]).is_err() {
                break;
            }
            for byte in &buf[..len] {
                services.tx.add_byte(*byte);
            }
            offset += len as u32;
        }
        services.tx.finish_message();
    }

    fn handle_write_start<H: Host>(&mut self, body: &[u8], services: &mut Services<'_, H>) {
        self.file = FileMetadata::default();
        let mut reader = BodyReader::new(body);

        let parsed = (|| {
            let name = reader.file_name()?;
            let size = reader.u32()?;
            let checksum = reader.u16()?;
            let timestamp = reader.u32()?;
            let code = reader.code()?;
            Ok::<_, ftp::BodyError>((name, size, checksum, timestamp, code))
        })();
        let Ok((name, size, checksum, timestamp, code)) = parsed else {
            return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services);
        };
        if !self.code_is_valid(code) {
            return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services);
        }

        self.file.name = FileName::try_from(name).unwrap_or_default();
        self.file.size = size;
        self.file.checksum = checksum;
        self.file.timestamp = timestamp;
        self.file.volume = services.host.file_to_volume(&self.file.name);

        if storage::create_file(services.host, &mut self.file).is_err() {
            warn!("no room for {} byte file write", size);
            return self.refuse(keys::RESPONSE_FTP_DISK_FULL, services);
        }

        services.start_message(self.client_address);
        services.tx.add_u16(keys::RESPONSE_FILE_WRITE_START.raw());
        services.tx.add_str(&self.file.name);
        services.tx.finish_message();
    }

    fn handle_write_segment<H: Host>(&mut self, body: &[u8], services: &mut Services<'_, H>) {
        if self.file.size == 0 {
            return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services);
        }
        let mut reader = BodyReader::new(body);
        let (segment, code) = match (reader.u16(), reader.code()) {
            (Ok(s), Ok(c)) => (s, c),
            _ => return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services),
        };
        if !self.code_is_valid(code) {
            return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services);
        }

        let data = reader.remaining();
        let offset = segment as u32 * SEGMENT_LEN as u32;
        if storage::write_data(services.host, self.file.volume, &self.file.name, offset, data)
            .is_err()
        {
            return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services);
        }

        services.start_message(self.client_address);
        services.tx.add_u16(keys::RESPONSE_FILE_WRITE_SEGMENT.raw());
        services.tx.add_u16(segment);
        services.tx.finish_message();
    }

    fn handle_delete<H: Host>(&mut self, body: &[u8], services: &mut Services<'_, H>) {
        self.file = FileMetadata::default();
        let mut reader = BodyReader::new(body);

        let Ok(name) = reader.file_name() else {
            return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services);
        };
        let Ok(code) = reader.code() else {
            return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services);
        };
        if !self.code_is_valid(code) {
            return self.refuse(keys::RESPONSE_FTP_CLIENT_ERROR, services);
        }

        self.file.name = FileName::try_from(name).unwrap_or_default();
        self.file.volume = services.host.file_to_volume(&self.file.name);

        if storage::delete_file(services.host, self.file.volume, &self.file.name).is_err() {
            return self.refuse(keys::RESPONSE_FILE_NOT_FOUND, services);
        }

        services.start_message(self.client_address);
        services.tx.add_u16(keys::RESPONSE_FILE_DELETE.raw());
        services.tx.add_str(&self.file.name);
        services.tx.finish_message();
    }
}

/// Checksum application-served file data by streaming it through flash.
fn data_checksum<H: Host>(host: &mut H, file: &FileMetadata) -> u16 {
    let mut crc = 0u16;
    let mut offset = 0u32;
    let mut buf = [0u8; 16];
    while offset < file.size {
        let len = buf.len().min((file.size - offset) as usize);
        if host
            .flash_read(file.volume, file.location + offset, &mut buf[..len])
            .is_err()
        {
            break;
        }
        for byte in &buf[..len] {
            ecconet_common::crc::add_byte(&mut crc, *byte);
        }
        offset += len as u32;
    }
    crc
}
