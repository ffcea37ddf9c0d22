//! Record layouts for shared captures.
//!
//! The master record holds one field per capture. The worker-warp record
//! holds one array per capture with an element per lane. Both are laid
//! out from the same capture list in the same order, so field `i` of
//! either record belongs to capture `i`.

use std::fmt;

use super::{CaptureDescriptor, SharingMode};
use crate::config::device::align_up;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    /// C spelling of the element type, for listings.
    pub ty_name: String,
    pub elem_size: u32,
    pub elem_align: u32,
    /// 1 in the master record, the warp size in the worker record.
    pub count: u32,
    pub offset: u32,
}

impl FieldLayout {
    pub fn size(&self) -> u32 {
        self.elem_size * self.count
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    pub name: String,
    pub fields: Vec<FieldLayout>,
    pub size: u32,
    pub align: u32,
}

impl RecordLayout {
    pub fn master(name: impl Into<String>, captures: &[CaptureDescriptor], pointer_width: u32) -> Self {
        Self::build(name.into(), captures, 1, pointer_width)
    }

    pub fn worker(
        name: impl Into<String>,
        captures: &[CaptureDescriptor],
        warp_size: u32,
        pointer_width: u32,
    ) -> Self {
        Self::build(name.into(), captures, warp_size, pointer_width)
    }

    fn build(name: String, captures: &[CaptureDescriptor], count: u32, pointer_width: u32) -> Self {
        let mut fields = Vec::with_capacity(captures.len());
        let mut offset = 0;
        let mut align = 1;
        for cap in captures {
            let (elem_size, elem_align, ty_name) = match cap.mode {
                SharingMode::ByReference => {
                    (pointer_width, pointer_width, format!("{}*", cap.ty))
                }
                SharingMode::ByValueAddress | SharingMode::ByPointerCast => {
                    (cap.ty_size, cap.ty_align, cap.ty.to_string())
                }
            };
            offset = align_up(offset, elem_align);
            align = align.max(elem_align);
            fields.push(FieldLayout {
                name: cap.name.clone(),
                ty_name,
                elem_size,
                elem_align,
                count,
                offset,
            });
            offset += elem_size * count;
        }
        Self {
            name,
            size: align_up(offset, align),
            align,
            fields,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

impl fmt::Display for RecordLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "struct {} {{", self.name)?;
        for field in &self.fields {
            if field.count == 1 {
                write!(f, " {} {};", field.ty_name, field.name)?;
            } else {
                write!(f, " {} {}[{}];", field.ty_name, field.name, field.count)?;
            }
        }
        write!(f, " }} /* size {}, align {} */", self.size, self.align)
    }
}
