// ABOUTME: Turns host property answers into a checked plan of pending archive updates.
// ABOUTME: Rejects values whose type does not fit the property and normalises anti items and directories.

use packrat_core::{
    ATTRIBUTE_DIRECTORY, ArchiveDatabase, EntryTimes, PropValue, PropertyKind, PropertyProvider,
    ProviderError,
};
use thiserror::Error;

/// Errors raised while collecting update items from a host.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("item {index}: {reason}")]
    InvalidArgument { index: u32, reason: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl UpdateError {
    fn wrong_type(index: u32, kind: PropertyKind, value: &PropValue) -> Self {
        UpdateError::InvalidArgument {
            index,
            reason: format!("property {kind} cannot be {}", value.type_name()),
        }
    }
}

/// Which optional timestamps are recorded for new entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderOptions {
    pub write_ctime: bool,
    pub write_atime: bool,
    pub write_mtime: bool,
}

impl Default for HeaderOptions {
    fn default() -> Self {
        Self {
            write_ctime: false,
            write_atime: false,
            write_mtime: true,
        }
    }
}

/// One pending change, with its properties resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateItem {
    pub new_data: bool,
    pub new_props: bool,
    pub index_in_archive: Option<u32>,
    pub name: String,
    pub attrib: Option<u32>,
    pub times: EntryTimes,
    pub is_dir: bool,
    pub is_anti: bool,
    pub size: u64,
}

/// Ask `provider` about `count` pending items and build the update plan.
/// Items that already exist in `db` start from their recorded values.
pub fn plan_update_items<P>(
    provider: &P,
    db: &ArchiveDatabase,
    count: u32,
    options: &HeaderOptions,
) -> Result<Vec<UpdateItem>, UpdateError>
where
    P: PropertyProvider + ?Sized,
{
    let mut items = Vec::with_capacity(count as usize);
    for index in 0..count {
        let info = provider.update_item_info(index)?;
        let mut item = UpdateItem {
            new_data: info.new_data,
            new_props: info.new_properties,
            index_in_archive: info.index_in_archive,
            ..UpdateItem::default()
        };

        if let Some(existing) = info.index_in_archive {
            inherit_from_archive(&mut item, db, index, existing)?;
        }
        if item.new_props {
            read_new_properties(&mut item, provider, index, options)?;
        }
        if item.new_data {
            item.size = match provider.property(index, PropertyKind::Size)? {
                PropValue::U64(size) => size,
                other => return Err(UpdateError::wrong_type(index, PropertyKind::Size, &other)),
            };
            if item.size != 0 && item.is_anti {
                return Err(UpdateError::InvalidArgument {
                    index,
                    reason: format!("anti item carries {} bytes of data", item.size),
                });
            }
        }

        items.push(item);
    }
    Ok(items)
}

fn inherit_from_archive(
    item: &mut UpdateItem,
    db: &ArchiveDatabase,
    index: u32,
    existing: u32,
) -> Result<(), UpdateError> {
    let at = existing as usize;
    let Some(entry) = db.entries.get(at) else {
        return Err(UpdateError::InvalidArgument {
            index,
            reason: format!("archive has no item {existing}"),
        });
    };
    item.name = entry.name.clone();
    item.attrib = entry.attrib;
    item.is_dir = entry.is_dir;
    item.size = entry.size;
    item.is_anti = db.is_anti.get(at).copied().unwrap_or(false);
    item.times = EntryTimes {
        start_pos: None,
        ..db.entry_times(at)
    };
    Ok(())
}

fn read_new_properties<P>(
    item: &mut UpdateItem,
    provider: &P,
    index: u32,
    options: &HeaderOptions,
) -> Result<(), UpdateError>
where
    P: PropertyProvider + ?Sized,
{
    item.attrib = match provider.property(index, PropertyKind::Attrib)? {
        PropValue::Empty => None,
        PropValue::U32(attrib) => Some(attrib),
        other => return Err(UpdateError::wrong_type(index, PropertyKind::Attrib, &other)),
    };

    let time = |kind: PropertyKind, enabled: bool| -> Result<Option<u64>, UpdateError> {
        if !enabled {
            return Ok(None);
        }
        match provider.property(index, kind)? {
            PropValue::Empty => Ok(None),
            PropValue::FileTime(ticks) => Ok(Some(ticks)),
            other => Err(UpdateError::wrong_type(index, kind, &other)),
        }
    };
    item.times = EntryTimes {
        ctime: time(PropertyKind::CTime, options.write_ctime)?,
        atime: time(PropertyKind::ATime, options.write_atime)?,
        mtime: time(PropertyKind::MTime, options.write_mtime)?,
        start_pos: None,
    };

    match provider.property(index, PropertyKind::Path)? {
        PropValue::Empty => {}
        PropValue::Str(path) => item.name = path,
        other => return Err(UpdateError::wrong_type(index, PropertyKind::Path, &other)),
    }

    let dir_defined = match provider.property(index, PropertyKind::IsDir)? {
        PropValue::Empty => false,
        PropValue::Bool(is_dir) => {
            item.is_dir = is_dir;
            true
        }
        other => return Err(UpdateError::wrong_type(index, PropertyKind::IsDir, &other)),
    };

    item.is_anti = match provider.property(index, PropertyKind::IsAnti)? {
        PropValue::Empty => false,
        PropValue::Bool(is_anti) => is_anti,
        other => return Err(UpdateError::wrong_type(index, PropertyKind::IsAnti, &other)),
    };

    if item.is_anti {
        item.attrib = None;
        item.times = EntryTimes::default();
        item.size = 0;
    }

    if !dir_defined && let Some(attrib) = item.attrib {
        item.is_dir = attrib & ATTRIBUTE_DIRECTORY != 0;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use packrat_core::{Entry, UpdateItemInfo};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Host {
        infos: Vec<UpdateItemInfo>,
        props: HashMap<(u32, PropertyKind), PropValue>,
    }

    impl Host {
        fn with_item(mut self, info: UpdateItemInfo, props: &[(PropertyKind, PropValue)]) -> Self {
            let index = self.infos.len() as u32;
            self.infos.push(info);
            for (kind, value) in props {
                self.props.insert((index, *kind), value.clone());
            }
            self
        }
    }

    impl PropertyProvider for Host {
        fn update_item_info(&self, index: u32) -> Result<UpdateItemInfo, ProviderError> {
            self.infos
                .get(index as usize)
                .copied()
                .ok_or_else(|| ProviderError(format!("no item {index}")))
        }

        fn property(&self, index: u32, kind: PropertyKind) -> Result<PropValue, ProviderError> {
            Ok(self
                .props
                .get(&(index, kind))
                .cloned()
                .unwrap_or(PropValue::Empty))
        }
    }

    const NEW: UpdateItemInfo = UpdateItemInfo {
        new_data: true,
        new_properties: true,
        index_in_archive: None,
    };

    #[test]
    fn new_file_collects_properties() {
        let host = Host::default().with_item(
            NEW,
            &[
                (PropertyKind::Path, PropValue::Str("docs/readme.txt".to_string())),
                (PropertyKind::Attrib, PropValue::U32(0x20)),
                (PropertyKind::MTime, PropValue::FileTime(132_000_000_000_000_000)),
                (PropertyKind::CTime, PropValue::FileTime(1)),
                (PropertyKind::Size, PropValue::U64(512)),
            ],
        );

        let items =
            plan_update_items(&host, &ArchiveDatabase::new(), 1, &HeaderOptions::default()).unwrap();
        let item = &items[0];
        assert_eq!(item.name, "docs/readme.txt");
        assert_eq!(item.attrib, Some(0x20));
        assert_eq!(item.times.mtime, Some(132_000_000_000_000_000));
        // Creation time is not recorded unless enabled.
        assert_eq!(item.times.ctime, None);
        assert_eq!(item.size, 512);
        assert!(!item.is_dir);
    }

    #[test]
    fn directory_flag_comes_from_attrib_when_undefined() {
        let host = Host::default().with_item(
            UpdateItemInfo {
                new_data: false,
                ..NEW
            },
            &[
                (PropertyKind::Path, PropValue::Str("photos".to_string())),
                (PropertyKind::Attrib, PropValue::U32(ATTRIBUTE_DIRECTORY)),
            ],
        );

        let items =
            plan_update_items(&host, &ArchiveDatabase::new(), 1, &HeaderOptions::default()).unwrap();
        assert!(items[0].is_dir);
    }

    #[test]
    fn explicit_directory_flag_wins_over_attrib() {
        let host = Host::default().with_item(
            UpdateItemInfo {
                new_data: false,
                ..NEW
            },
            &[
                (PropertyKind::Attrib, PropValue::U32(ATTRIBUTE_DIRECTORY)),
                (PropertyKind::IsDir, PropValue::Bool(false)),
            ],
        );

        let items =
            plan_update_items(&host, &ArchiveDatabase::new(), 1, &HeaderOptions::default()).unwrap();
        assert!(!items[0].is_dir);
    }

    #[test]
    fn anti_item_drops_attrib_and_times() {
        let host = Host::default().with_item(
            NEW,
            &[
                (PropertyKind::Path, PropValue::Str("gone.txt".to_string())),
                (PropertyKind::Attrib, PropValue::U32(0x20)),
                (PropertyKind::MTime, PropValue::FileTime(99)),
                (PropertyKind::IsAnti, PropValue::Bool(true)),
                (PropertyKind::Size, PropValue::U64(0)),
            ],
        );

        let items =
            plan_update_items(&host, &ArchiveDatabase::new(), 1, &HeaderOptions::default()).unwrap();
        assert!(items[0].is_anti);
        assert_eq!(items[0].attrib, None);
        assert_eq!(items[0].times, EntryTimes::default());
    }

    #[test]
    fn anti_item_with_data_is_rejected() {
        let host = Host::default().with_item(
            NEW,
            &[
                (PropertyKind::IsAnti, PropValue::Bool(true)),
                (PropertyKind::Size, PropValue::U64(3)),
            ],
        );

        let err = plan_update_items(&host, &ArchiveDatabase::new(), 1, &HeaderOptions::default())
            .unwrap_err();
        assert!(matches!(err, UpdateError::InvalidArgument { index: 0, .. }));
    }

    #[test]
    fn wrong_property_type_is_invalid_argument() {
        let host = Host::default().with_item(
            NEW,
            &[(PropertyKind::Attrib, PropValue::Str("rw".to_string()))],
        );

        let err = plan_update_items(&host, &ArchiveDatabase::new(), 1, &HeaderOptions::default())
            .unwrap_err();
        match err {
            UpdateError::InvalidArgument { reason, .. } => {
                assert_eq!(reason, "property attrib cannot be string");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn new_data_requires_a_u64_size() {
        let host = Host::default().with_item(NEW, &[(PropertyKind::Size, PropValue::U32(5))]);

        let err = plan_update_items(&host, &ArchiveDatabase::new(), 1, &HeaderOptions::default())
            .unwrap_err();
        assert!(matches!(err, UpdateError::InvalidArgument { .. }));
    }

    #[test]
    fn existing_item_inherits_recorded_values() {
        let mut db = ArchiveDatabase::new();
        let times = EntryTimes {
            mtime: Some(42),
            start_pos: Some(7),
            ..EntryTimes::default()
        };
        db.push_entry(Entry::file("kept.bin", 900, Some(1)), times, false);
        let host = Host::default().with_item(
            UpdateItemInfo {
                new_data: false,
                new_properties: false,
                index_in_archive: Some(0),
            },
            &[],
        );

        let items = plan_update_items(&host, &db, 1, &HeaderOptions::default()).unwrap();
        assert_eq!(items[0].name, "kept.bin");
        assert_eq!(items[0].size, 900);
        assert_eq!(items[0].times.mtime, Some(42));
        assert_eq!(items[0].times.start_pos, None);
    }

    #[test]
    fn unknown_archive_index_is_rejected() {
        let host = Host::default().with_item(
            UpdateItemInfo {
                index_in_archive: Some(3),
                ..NEW
            },
            &[],
        );

        let err = plan_update_items(&host, &ArchiveDatabase::new(), 1, &HeaderOptions::default())
            .unwrap_err();
        assert!(matches!(err, UpdateError::InvalidArgument { index: 0, .. }));
    }

    #[test]
    fn provider_failures_propagate() {
        let host = Host::default();
        let err = plan_update_items(&host, &ArchiveDatabase::new(), 1, &HeaderOptions::default())
            .unwrap_err();
        assert!(matches!(err, UpdateError::Provider(_)));
    }
}
