// Fixture PE builder shared by the core and cli integration tests.
#![allow(dead_code)]

pub const IMAGE_BASE: u64 = 0x1000_0000;
/// Where `build_pe` places the Boot Services global.
pub const GBS_GLOBAL: u64 = IMAGE_BASE + 0x2000;
/// Where `build_pe` places the GUID.
pub const GUID_ADDR: u64 = IMAGE_BASE + 0x2010;
/// Address of `call [rax+0x98]` in `build_pe`.
pub const CALL_ADDR: u64 = IMAGE_BASE + 0x1011;

/// EFI_LOADED_IMAGE_PROTOCOL, 5B1B31A1-9562-11D2-8E3F-00A0C969723B, as stored in memory.
pub const LOADED_IMAGE_GUID: [u8; 16] = [
    0xA1, 0x31, 0x1B, 0x5B, 0x62, 0x95, 0xD2, 0x11, 0x8E, 0x3F, 0x00, 0xA0, 0xC9, 0x69, 0x72, 0x3B,
];

/// A GUID none of the bundled databases knows.
pub const UNKNOWN_GUID: [u8; 16] = [
    0x10, 0x32, 0x54, 0x76, 0x98, 0xBA, 0xDC, 0xFE, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF,
];

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// DOS stub plus the PE signature, machine and subsystem fields; enough for
/// the header pre-check.
pub fn pe_header(machine: u16, subsystem: u16) -> Vec<u8> {
    let mut bytes = vec![0u8; 0x200];
    bytes[0] = b'M';
    bytes[1] = b'Z';
    put_u32(&mut bytes, 0x3C, 0x80);
    bytes[0x80..0x84].copy_from_slice(b"PE\0\0");
    put_u16(&mut bytes, 0x84, machine);
    put_u16(&mut bytes, 0xDC, subsystem);
    bytes
}

/// Minimal PE32+ boot service driver: `.text` at RVA 0x1000, `.data` at RVA 0x2000.
///
/// ```text
/// 0x1000  mov rax, [rip+0xff9]     ; gBS at .data+0x00
/// 0x1007  lea rdx, [rip+0x1002]    ; GUID at .data+0x10
/// 0x100E  xor r8d, r8d
/// 0x1011  call [rax+0x98]          ; HandleProtocol
/// 0x1017  ret
/// ```
pub fn build_pe(guid: [u8; 16]) -> Vec<u8> {
    let mut pe = pe_header(0x8664, 0x0B);
    pe.resize(0x600, 0);

    // COFF header
    put_u16(&mut pe, 0x86, 2);
    put_u16(&mut pe, 0x94, 0xF0);
    put_u16(&mut pe, 0x96, 0x22);

    // Optional header (PE32+)
    put_u16(&mut pe, 0x98, 0x20B);
    put_u32(&mut pe, 0x9C, 0x200);
    put_u32(&mut pe, 0xA0, 0x200);
    put_u32(&mut pe, 0xA8, 0x1000);
    put_u32(&mut pe, 0xAC, 0x1000);
    put_u64(&mut pe, 0xB0, IMAGE_BASE);
    put_u32(&mut pe, 0xB8, 0x1000);
    put_u32(&mut pe, 0xBC, 0x200);
    put_u32(&mut pe, 0xD0, 0x3000);
    put_u32(&mut pe, 0xD4, 0x200);
    put_u64(&mut pe, 0xE0, 0x10_0000);
    put_u64(&mut pe, 0xE8, 0x1000);
    put_u64(&mut pe, 0xF0, 0x10_0000);
    put_u64(&mut pe, 0xF8, 0x1000);
    put_u32(&mut pe, 0x104, 16);

    // Section table
    let sections: [(&[u8; 8], u32, u32, u32); 2] =
        [(b".text\0\0\0", 0x1000, 0x200, 0x6000_0020), (b".data\0\0\0", 0x2000, 0x400, 0xC000_0040)];
    for (index, (name, rva, raw, characteristics)) in sections.iter().enumerate() {
        let at = 0x188 + index * 40;
        pe[at..at + 8].copy_from_slice(*name);
        put_u32(&mut pe, at + 8, 0x200);
        put_u32(&mut pe, at + 12, *rva);
        put_u32(&mut pe, at + 16, 0x200);
        put_u32(&mut pe, at + 20, *raw);
        put_u32(&mut pe, at + 36, *characteristics);
    }

    #[rustfmt::skip]
    let code = [
        0x48, 0x8B, 0x05, 0xF9, 0x0F, 0x00, 0x00, // mov rax, [rip+0xff9]
        0x48, 0x8D, 0x15, 0x02, 0x10, 0x00, 0x00, // lea rdx, [rip+0x1002]
        0x45, 0x31, 0xC0,                         // xor r8d, r8d
        0xFF, 0x90, 0x98, 0x00, 0x00, 0x00,       // call [rax+0x98]
        0xC3,                                     // ret
    ];
    pe[0x200..0x200 + code.len()].copy_from_slice(&code);
    pe[0x410..0x420].copy_from_slice(&guid);
    pe
}
