//! Descriptor-update-template side table.
//!
//! Template entries are bucketed by descriptor kind at creation so that a
//! later templated update can be serialized as tightly packed arrays, one per
//! kind. `max_size` is the smallest contiguous host byte range that contains
//! every recognized entry's data, which is all the serializer needs to copy.

use tracing::error;

/// Host byte sizes of the per-kind descriptor payload structures.
pub const IMAGE_DESCRIPTOR_PAYLOAD_SIZE: usize = 24;
pub const BUFFER_DESCRIPTOR_PAYLOAD_SIZE: usize = 24;
pub const TEXEL_BUFFER_VIEW_PAYLOAD_SIZE: usize = 8;

/// Raw descriptor-kind tag as defined by the traced API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorType(pub u32);

impl DescriptorType {
    pub const SAMPLER: DescriptorType = DescriptorType(0);
    pub const COMBINED_IMAGE_SAMPLER: DescriptorType = DescriptorType(1);
    pub const SAMPLED_IMAGE: DescriptorType = DescriptorType(2);
    pub const STORAGE_IMAGE: DescriptorType = DescriptorType(3);
    pub const UNIFORM_TEXEL_BUFFER: DescriptorType = DescriptorType(4);
    pub const STORAGE_TEXEL_BUFFER: DescriptorType = DescriptorType(5);
    pub const UNIFORM_BUFFER: DescriptorType = DescriptorType(6);
    pub const STORAGE_BUFFER: DescriptorType = DescriptorType(7);
    pub const UNIFORM_BUFFER_DYNAMIC: DescriptorType = DescriptorType(8);
    pub const STORAGE_BUFFER_DYNAMIC: DescriptorType = DescriptorType(9);
    pub const INPUT_ATTACHMENT: DescriptorType = DescriptorType(10);
}

enum EntryClass {
    Image,
    Buffer,
    TexelBufferView,
}

fn classify(descriptor_type: DescriptorType) -> Option<(EntryClass, usize)> {
    match descriptor_type {
        DescriptorType::SAMPLER
        | DescriptorType::COMBINED_IMAGE_SAMPLER
        | DescriptorType::SAMPLED_IMAGE
        | DescriptorType::STORAGE_IMAGE
        | DescriptorType::INPUT_ATTACHMENT => {
            Some((EntryClass::Image, IMAGE_DESCRIPTOR_PAYLOAD_SIZE))
        }
        DescriptorType::UNIFORM_BUFFER
        | DescriptorType::STORAGE_BUFFER
        | DescriptorType::UNIFORM_BUFFER_DYNAMIC
        | DescriptorType::STORAGE_BUFFER_DYNAMIC => {
            Some((EntryClass::Buffer, BUFFER_DESCRIPTOR_PAYLOAD_SIZE))
        }
        DescriptorType::UNIFORM_TEXEL_BUFFER | DescriptorType::STORAGE_TEXEL_BUFFER => Some((
            EntryClass::TexelBufferView,
            TEXEL_BUFFER_VIEW_PAYLOAD_SIZE,
        )),
        _ => None,
    }
}

/// One template entry as described by the application at creation time.
/// `offset` and `stride` locate the entry's data in the host byte blob passed
/// to a templated update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateTemplateEntry {
    pub binding: u32,
    pub array_element: u32,
    pub count: u32,
    pub offset: usize,
    pub stride: usize,
    pub descriptor_type: DescriptorType,
}

#[derive(Clone, Debug, Default)]
pub struct UpdateTemplateInfo {
    pub image_entries: Vec<UpdateTemplateEntry>,
    pub buffer_entries: Vec<UpdateTemplateEntry>,
    pub texel_buffer_view_entries: Vec<UpdateTemplateEntry>,
    pub image_count: u32,
    pub buffer_count: u32,
    pub texel_buffer_view_count: u32,
    /// Upper bound of `(count - 1) * stride + offset + payload_size` over the
    /// recognized entries. Unrecognized kinds do not contribute, so the bound
    /// may under-count for future descriptor types.
    pub max_size: usize,
}

pub(crate) fn build_update_template_info(entries: &[UpdateTemplateEntry]) -> UpdateTemplateInfo {
    let mut info = UpdateTemplateInfo::default();

    for entry in entries {
        let Some((class, payload_size)) = classify(entry.descriptor_type) else {
            error!(
                descriptor_type = entry.descriptor_type.0,
                "unrecognized descriptor type in descriptor update template"
            );
            continue;
        };

        match class {
            EntryClass::Image => {
                info.image_count += entry.count;
                info.image_entries.push(*entry);
            }
            EntryClass::Buffer => {
                info.buffer_count += entry.count;
                info.buffer_entries.push(*entry);
            }
            EntryClass::TexelBufferView => {
                info.texel_buffer_view_count += entry.count;
                info.texel_buffer_view_entries.push(*entry);
            }
        }

        if entry.count > 0 {
            let size = (entry.count as usize - 1) * entry.stride + entry.offset + payload_size;
            info.max_size = info.max_size.max(size);
        }
    }

    info
}
