//! Speaker registry
//!
//! Maps a voice name to the row of the speaker embedding table that conditions
//! the acoustic model. The catalog is fixed at process start and only read
//! afterwards, so one registry is shared by every worker.

use std::collections::HashMap;
use std::fmt;

/// Number of rows in the speaker embedding table.
pub const SPEAKER_SLOTS: u32 = 100;

/// Name that always resolves to [`SpeakerId::DEFAULT`].
pub const DEFAULT_SPEAKER: &str = "default";

/// Voices known to the bundled checkpoint, in embedding order.
const CATALOG: &[&str] = &[
    "Paimon", "Traveler", "Venti", "Zhongli", "Childe", "Albedo", "Ganyu", "Xiao", "Keqing",
    "Mona", "Jean", "Diluc", "Kaeya", "Lisa", "Amber", "Barbara", "Fischl", "Noelle", "Bennett",
    "Razor", "Chongyun", "Xingqiu", "Sucrose", "Diona", "Tartaglia", "Xinyan", "Rosaria",
    "Hu Tao", "Yanfei", "Eula", "Kazuha", "Ayaka", "Yoimiya", "Sayu", "Kokomi", "Gorou",
    "Thoma", "Itto", "Yae Miko", "Ayato", "Yelan", "Shinobu", "Heizou", "Collei", "Tighnari",
    "Dori", "Candace", "Nilou", "Nahida", "Layla", "Faruzan", "Wanderer", "Alhaitham",
    "Yaoyao", "Baizhu", "Kaveh", "Kirara", "Lynette", "Lyney", "Freminet", "Furina",
    "Charlotte", "Neuvillette", "Wriothesley", "Xianyun", "Gaming", "Chevreuse", "Chiori",
    "Arlecchino",
];

/// Index into the speaker embedding table, always below [`SPEAKER_SLOTS`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeakerId(u32);

impl SpeakerId {
    /// Reserved id used for unknown names.
    pub const DEFAULT: SpeakerId = SpeakerId(0);

    /// Returns `None` when `index` does not fit the embedding table.
    pub fn new(index: u32) -> Option<Self> {
        (index < SPEAKER_SLOTS).then_some(Self(index))
    }

    /// Wrap an arbitrary catalog position into the table.
    pub fn from_catalog_index(index: usize) -> Self {
        Self((index % SPEAKER_SLOTS as usize) as u32)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Case-insensitive, read-only speaker lookup
#[derive(Clone, Debug)]
pub struct SpeakerRegistry {
    ids: HashMap<String, SpeakerId>,
}

impl SpeakerRegistry {
    /// Registry over the bundled voice catalog.
    pub fn new() -> Self {
        Self::from_names(CATALOG.iter().copied())
    }

    /// Registry over a custom catalog. Positions wrap modulo [`SPEAKER_SLOTS`];
    /// the `default` name always maps to id 0.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut ids = HashMap::new();
        for (i, name) in names.into_iter().enumerate() {
            ids.entry(Self::key(name))
                .or_insert_with(|| SpeakerId::from_catalog_index(i));
        }
        ids.insert(DEFAULT_SPEAKER.to_string(), SpeakerId::DEFAULT);
        Self { ids }
    }

    fn key(name: &str) -> String {
        name.trim().to_lowercase()
    }

    /// Resolve a speaker name. Unknown names resolve to [`SpeakerId::DEFAULT`].
    pub fn resolve(&self, name: &str) -> SpeakerId {
        self.ids
            .get(&Self::key(name))
            .copied()
            .unwrap_or(SpeakerId::DEFAULT)
    }

    /// Whether the name is in the catalog (case-insensitive)
    pub fn contains(&self, name: &str) -> bool {
        self.ids.contains_key(&Self::key(name))
    }

    /// Known names, lower-cased and sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ids.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Default for SpeakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_positions() {
        let registry = SpeakerRegistry::new();
        assert_eq!(registry.resolve("Paimon"), SpeakerId::DEFAULT);
        assert_eq!(registry.resolve("Traveler").index(), 1);
        assert_eq!(registry.resolve("Arlecchino").index(), 68);
    }

    #[test]
    fn test_case_insensitive() {
        let registry = SpeakerRegistry::new();
        assert_eq!(registry.resolve("hu tao"), registry.resolve("HU TAO"));
        assert_eq!(registry.resolve("  Venti "), registry.resolve("venti"));
        assert!(registry.contains("YAE MIKO"));
    }

    #[test]
    fn test_unknown_resolves_to_default() {
        let registry = SpeakerRegistry::new();
        assert_eq!(registry.resolve("nobody"), SpeakerId::DEFAULT);
        assert_eq!(registry.resolve(""), SpeakerId::DEFAULT);
        assert!(!registry.contains("nobody"));
    }

    #[test]
    fn test_list_includes_default() {
        let registry = SpeakerRegistry::new();
        let names = registry.list();
        assert_eq!(names.len(), CATALOG.len() + 1);
        assert!(names.contains(&"default".to_string()));
        assert!(names.contains(&"neuvillette".to_string()));
        assert!(names.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_indices_wrap() {
        let names: Vec<String> = (0..150).map(|i| format!("voice{i}")).collect();
        let registry = SpeakerRegistry::from_names(names.iter().map(String::as_str));
        assert_eq!(registry.resolve("voice120").index(), 20);
        assert!(registry.list().iter().all(|n| registry.resolve(n).index() < SPEAKER_SLOTS));
    }

    #[test]
    fn test_speaker_id_bounds() {
        assert!(SpeakerId::new(99).is_some());
        assert!(SpeakerId::new(100).is_none());
        assert_eq!(SpeakerId::from_catalog_index(205).index(), 5);
    }
}
