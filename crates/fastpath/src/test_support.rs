//! Frame builders shared by the classifier and parser tests.

pub fn tcp_frame(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    build_frame(src, dst, src_port, dst_port, 6, payload)
}

pub fn udp_frame(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    build_frame(src, dst, src_port, dst_port, 17, payload)
}

fn build_frame(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let l4_header_len = if protocol == 6 { 20 } else { 8 };
    let total_len = 20 + l4_header_len + payload.len();

    let mut frame = Vec::with_capacity(14 + total_len);

    // Ethernet II
    frame.extend_from_slice(&[0u8; 12]);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());

    // IPv4, no options
    frame.push(0x45);
    frame.push(0);
    frame.extend_from_slice(&(total_len as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0]); // id + flags/frag
    frame.push(64);
    frame.push(protocol);
    frame.extend_from_slice(&[0, 0]); // checksum unvalidated
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&dst);

    if protocol == 6 {
        frame.extend_from_slice(&src_port.to_be_bytes());
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend_from_slice(&[0u8; 8]); // seq + ack
        frame.push(0x50); // data offset 5
        frame.push(0x18); // PSH|ACK
        frame.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]); // window, csum, urg
    } else {
        frame.extend_from_slice(&src_port.to_be_bytes());
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
    }

    frame.extend_from_slice(payload);
    frame
}

/// A well-formed Java handshake: length 7, packet id 0x00, protocol
/// version 760, trailing dummy fields.
pub fn handshake_payload() -> Vec<u8> {
    vec![0x07, 0x00, 0xf8, 0x05, 0x01, 0x02, 0x03]
}

/// A RakNet unconnected ping with the full offline-message magic.
pub fn unconnected_ping() -> Vec<u8> {
    let mut payload = vec![0x05];
    payload.extend_from_slice(&crate::OFFLINE_MESSAGE_DATA_ID);
    payload.extend_from_slice(&[0u8; 8]); // ping time
    payload
}
