//! Human readable session passphrases.

use rand::Rng;

/// Number of words in a generated passphrase.
pub const PASSPHRASE_WORD_COUNT: usize = 4;

/// Pick `count` words uniformly from `words`, separated by spaces.
pub fn generate_from(words: &[&str], count: usize) -> String {
    if words.is_empty() {
        return String::new();
    }

    let mut rng = rand::rng();
    (0..count)
        .map(|_| words[rng.random_range(0..words.len())])
        .collect::<Vec<_>>()
        .join(" ")
}

/// Four words from the built in list.
pub fn generate() -> String {
    generate_from(WORDLIST, PASSPHRASE_WORD_COUNT)
}

pub const WORDLIST: &[&str] = &[
    "able", "acid", "acre", "aged", "aide", "alarm", "album", "alley", "amber", "ample",
    "angle", "ankle", "apple", "april", "apron", "arena", "armor", "army", "arrow", "atlas",
    "atom", "attic", "audio", "aunt", "avoid", "award", "axis", "bacon", "badge", "bagel",
    "baker", "bald", "bamboo", "banjo", "barn", "basil", "basin", "batch", "beach", "beam",
    "bean", "bench", "berry", "bike", "birch", "bison", "blade", "blank", "blaze", "bloom",
    "board", "boat", "bolt", "bonus", "boost", "booth", "brave", "bread", "brick", "brook",
    "brush", "bucket", "buddy", "bugle", "cabin", "cable", "cactus", "cameo", "camp", "canal",
    "candy", "canoe", "canvas", "cargo", "carol", "carrot", "cedar", "chalk", "charm", "chef",
    "cherry", "chess", "chime", "cider", "cinema", "civic", "clam", "clay", "cliff", "clock",
    "cloud", "clover", "coast", "cobra", "cocoa", "comet", "coral", "cotton", "couch", "cove",
    "crane", "crate", "creek", "crisp", "crown", "cube", "curry", "cycle", "daisy", "dance",
    "delta", "denim", "depot", "desk", "dial", "diary", "dock", "dolphin", "donut", "dove",
    "dragon", "drift", "drum", "dune", "eagle", "easel", "echo", "elbow", "elder", "ember",
    "emu", "engine", "epic", "equal", "fable", "falcon", "fancy", "farm", "feast", "fence",
    "fern", "ferry", "fiber", "field", "finch", "flame", "flask", "fleet", "flint", "flute",
    "focus", "forest", "fossil", "fox", "frame", "frost", "fudge", "gala", "garden", "garlic",
    "gecko", "gem", "giant", "ginger", "glade", "globe", "glove", "goat", "gold", "gorge",
    "grain", "grape", "gravel", "grove", "guitar", "gull", "habit", "hammer", "harbor", "hazel",
    "heron", "hike", "hill", "honey", "hornet", "hotel", "husky", "igloo", "index", "iris",
    "island", "ivory", "jacket", "jade", "jelly", "jewel", "jolly", "juice", "jungle", "kayak",
    "kettle", "kiwi", "koala", "ladder", "lagoon", "lamp", "lantern", "lemon", "lilac", "linen",
    "lobster", "lotus", "lunar", "magnet", "mango", "maple", "marble", "meadow", "melon", "mint",
    "moose", "mosaic", "nectar", "noble", "nutmeg", "oasis", "ocean", "olive", "onion", "orbit",
    "otter", "oyster", "paddle", "panda", "paper", "parade", "pebble", "pepper", "piano", "pilot",
    "planet", "plum", "polar", "pony", "prairie", "puzzle", "quartz", "quilt", "rabbit", "radar",
    "raven", "reef", "ribbon", "river", "robin", "rocket", "saddle", "salmon", "sapphire", "scarf",
    "shell", "silver", "sketch", "sparrow", "spruce", "summit", "tango", "thistle", "tiger", "timber",
    "topaz", "tulip", "tundra", "velvet", "violin", "walnut", "willow", "zebra",
];
