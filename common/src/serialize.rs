//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Big-endian serialization of wire structures. A packet is usually written as a tuple
//! of its fields, so the length is known before anything is copied.

use crate::integers::U24;

pub trait Writer {
    fn written_len(&self) -> usize;
    fn write(&self, out: &mut dyn Writable);

    fn to_vec(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(self.written_len());
        self.write(&mut vec);
        vec
    }
}

/// A sink that takes whole writes; unlike `std::io::Write`, writing can't fail.
pub trait Writable {
    fn write(&mut self, input: &[u8]);
}

impl Writable for Vec<u8> {
    fn write(&mut self, input: &[u8]) {
        self.extend_from_slice(input);
    }
}

/// Rounds up to the next multiple of `M` (RTP and RTCP pad to 32-bit words).
pub fn round_up_to_multiple_of<const M: usize>(n: usize) -> usize {
    n.div_ceil(M) * M
}

macro_rules! impl_writer_be {
    ($($int:ty),+) => {
        $(
            impl Writer for $int {
                fn written_len(&self) -> usize {
                    std::mem::size_of::<$int>()
                }

                fn write(&self, out: &mut dyn Writable) {
                    out.write(&self.to_be_bytes())
                }
            }
        )+
    };
}

// Not u8, which would conflict with the [T: Writer] impl; write bytes as arrays or slices.
impl_writer_be!(u16, i16, u32, u64);

impl Writer for U24 {
    fn written_len(&self) -> usize {
        U24::SIZE
    }

    fn write(&self, out: &mut dyn Writable) {
        out.write(&u32::from(*self).to_be_bytes()[1..])
    }
}

impl<const N: usize> Writer for [u8; N] {
    fn written_len(&self) -> usize {
        N
    }

    fn write(&self, out: &mut dyn Writable) {
        out.write(self)
    }
}

impl Writer for [u8] {
    fn written_len(&self) -> usize {
        self.len()
    }

    fn write(&self, out: &mut dyn Writable) {
        out.write(self)
    }
}

impl Writer for Vec<u8> {
    fn written_len(&self) -> usize {
        self.len()
    }

    fn write(&self, out: &mut dyn Writable) {
        out.write(self)
    }
}

impl<T: Writer> Writer for Option<T> {
    fn written_len(&self) -> usize {
        self.as_ref().map_or(0, Writer::written_len)
    }

    fn write(&self, out: &mut dyn Writable) {
        if let Some(writer) = self {
            writer.write(out)
        }
    }
}

impl<T: Writer> Writer for [T] {
    fn written_len(&self) -> usize {
        self.iter().map(Writer::written_len).sum()
    }

    fn write(&self, out: &mut dyn Writable) {
        self.iter().for_each(|writer| writer.write(out))
    }
}

impl<T: Writer> Writer for Vec<T> {
    fn written_len(&self) -> usize {
        self[..].written_len()
    }

    fn write(&self, out: &mut dyn Writable) {
        self[..].write(out)
    }
}

// So references can go in tuples.
impl<T: Writer + ?Sized> Writer for &T {
    fn written_len(&self) -> usize {
        T::written_len(self)
    }

    fn write(&self, out: &mut dyn Writable) {
        T::write(self, out)
    }
}

macro_rules! impl_writer_tuple {
    ($($field:ident)+) => {
        impl<$($field: Writer),+> Writer for ($($field,)+) {
            #[allow(non_snake_case)]
            fn written_len(&self) -> usize {
                let ($($field,)+) = self;
                0 $(+ $field.written_len())+
            }

            #[allow(non_snake_case)]
            fn write(&self, out: &mut dyn Writable) {
                let ($($field,)+) = self;
                $($field.write(out);)+
            }
        }
    };
}

impl_writer_tuple!(A);
impl_writer_tuple!(A B);
impl_writer_tuple!(A B C);
impl_writer_tuple!(A B C D);
impl_writer_tuple!(A B C D E);
impl_writer_tuple!(A B C D E F);
impl_writer_tuple!(A B C D E F G);
