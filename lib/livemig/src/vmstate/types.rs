// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Leaf codecs: the fixed table of scalar encoders.

use crate::stream::Stream;
use crate::vmstate::{VmResult, VmStateError};

/// Marker byte written in place of a null element of a pointer array.
pub const VMS_NULLPTR_MARKER: u8 = 0x30;

/// Encoder/decoder pair for one scalar type.
///
/// `get` receives the current value of the destination, which lets the
/// checking codecs compare against it before (or instead of) storing.
pub struct Info<V> {
    pub name: &'static str,
    pub get: fn(&mut Stream, &mut V) -> VmResult,
    pub put: fn(&mut Stream, &V) -> VmResult,
}

macro_rules! info {
    ($ident:ident, $ty:ty, $name:literal, $get:expr, $put:expr) => {
        pub static $ident: Info<$ty> =
            Info { name: $name, get: $get, put: $put };
    };
}

info!(
    VMSTATE_INFO_BOOL,
    bool,
    "bool",
    |f, v| {
        *v = f.get_byte() != 0;
        Ok(())
    },
    |f, v| {
        f.put_byte(u8::from(*v));
        Ok(())
    }
);

info!(
    VMSTATE_INFO_INT8,
    i8,
    "int8",
    |f, v| {
        *v = f.get_byte() as i8;
        Ok(())
    },
    |f, v| {
        f.put_byte(*v as u8);
        Ok(())
    }
);

info!(
    VMSTATE_INFO_INT16,
    i16,
    "int16",
    |f, v| {
        *v = f.get_be16() as i16;
        Ok(())
    },
    |f, v| {
        f.put_be16(*v as u16);
        Ok(())
    }
);

info!(
    VMSTATE_INFO_INT32,
    i32,
    "int32",
    |f, v| {
        *v = f.get_be32() as i32;
        Ok(())
    },
    |f, v| {
        f.put_be32(*v as u32);
        Ok(())
    }
);

info!(
    VMSTATE_INFO_INT64,
    i64,
    "int64",
    |f, v| {
        *v = f.get_be64() as i64;
        Ok(())
    },
    |f, v| {
        f.put_be64(*v as u64);
        Ok(())
    }
);

info!(
    VMSTATE_INFO_UINT8,
    u8,
    "uint8",
    |f, v| {
        *v = f.get_byte();
        Ok(())
    },
    |f, v| {
        f.put_byte(*v);
        Ok(())
    }
);

info!(
    VMSTATE_INFO_UINT16,
    u16,
    "uint16",
    |f, v| {
        *v = f.get_be16();
        Ok(())
    },
    |f, v| {
        f.put_be16(*v);
        Ok(())
    }
);

info!(
    VMSTATE_INFO_UINT32,
    u32,
    "uint32",
    |f, v| {
        *v = f.get_be32();
        Ok(())
    },
    |f, v| {
        f.put_be32(*v);
        Ok(())
    }
);

info!(
    VMSTATE_INFO_UINT64,
    u64,
    "uint64",
    |f, v| {
        *v = f.get_be64();
        Ok(())
    },
    |f, v| {
        f.put_be64(*v);
        Ok(())
    }
);

info!(
    VMSTATE_INFO_FLOAT64,
    f64,
    "float64",
    |f, v| {
        *v = f64::from_bits(f.get_be64());
        Ok(())
    },
    |f, v| {
        f.put_be64(v.to_bits());
        Ok(())
    }
);

// Timer expiry in nanoseconds; an unarmed timer travels as all-ones.
info!(
    VMSTATE_INFO_TIMER,
    Option<u64>,
    "timer",
    |f, v| {
        *v = match f.get_be64() {
            u64::MAX => None,
            expiry => Some(expiry),
        };
        Ok(())
    },
    |f, v| {
        f.put_be64(v.unwrap_or(u64::MAX));
        Ok(())
    }
);

info!(
    VMSTATE_INFO_NULLPTR,
    (),
    "nullptr",
    |f, _| {
        match f.get_byte() {
            VMS_NULLPTR_MARKER => Ok(()),
            other => {
                f.error()?;
                Err(VmStateError::NotNullMarker(other))
            }
        }
    },
    |f, _| {
        f.put_byte(VMS_NULLPTR_MARKER);
        Ok(())
    }
);

fn mismatch<V: std::fmt::Display>(
    codec: &'static str,
    loaded: V,
    expected: V,
) -> VmStateError {
    VmStateError::ValueMismatch {
        codec,
        loaded: loaded.to_string(),
        expected: expected.to_string(),
    }
}

info!(
    VMSTATE_INFO_UINT8_EQUAL,
    u8,
    "uint8 equal",
    |f, v| {
        let loaded = f.get_byte();
        f.error()?;
        if loaded == *v {
            Ok(())
        } else {
            Err(mismatch("uint8 equal", loaded, *v))
        }
    },
    |f, v| {
        f.put_byte(*v);
        Ok(())
    }
);

info!(
    VMSTATE_INFO_UINT16_EQUAL,
    u16,
    "uint16 equal",
    |f, v| {
        let loaded = f.get_be16();
        f.error()?;
        if loaded == *v {
            Ok(())
        } else {
            Err(mismatch("uint16 equal", loaded, *v))
        }
    },
    |f, v| {
        f.put_be16(*v);
        Ok(())
    }
);

info!(
    VMSTATE_INFO_UINT32_EQUAL,
    u32,
    "uint32 equal",
    |f, v| {
        let loaded = f.get_be32();
        f.error()?;
        if loaded == *v {
            Ok(())
        } else {
            Err(mismatch("uint32 equal", loaded, *v))
        }
    },
    |f, v| {
        f.put_be32(*v);
        Ok(())
    }
);

info!(
    VMSTATE_INFO_UINT64_EQUAL,
    u64,
    "uint64 equal",
    |f, v| {
        let loaded = f.get_be64();
        f.error()?;
        if loaded == *v {
            Ok(())
        } else {
            Err(mismatch("uint64 equal", loaded, *v))
        }
    },
    |f, v| {
        f.put_be64(*v);
        Ok(())
    }
);

info!(
    VMSTATE_INFO_INT32_EQUAL,
    i32,
    "int32 equal",
    |f, v| {
        let loaded = f.get_be32() as i32;
        f.error()?;
        if loaded == *v {
            Ok(())
        } else {
            Err(mismatch("int32 equal", loaded, *v))
        }
    },
    |f, v| {
        f.put_be32(*v as u32);
        Ok(())
    }
);

// Accepts a loaded value in 0..=current and stores it.
info!(
    VMSTATE_INFO_INT32_LE,
    i32,
    "int32 le",
    |f, v| {
        let loaded = f.get_be32() as i32;
        f.error()?;
        if (0..=*v).contains(&loaded) {
            *v = loaded;
            Ok(())
        } else {
            Err(VmStateError::OutOfRange {
                codec: "int32 le",
                loaded: i64::from(loaded),
                limit: i64::from(*v),
            })
        }
    },
    |f, v| {
        f.put_be32(*v as u32);
        Ok(())
    }
);
