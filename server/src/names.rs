//! Hostname candidate generation
//!
//! Produces short, human readable `adjective-surname` labels in the style of
//! container names (`focused-hopper`, `eager-turing`). Uniqueness is not this
//! module's concern; the registration store rejects and redraws collisions.

use rand::seq::SliceRandom;

/// Source of hostname candidates
pub trait NameGenerator: Send + Sync {
    /// Produce the next candidate label
    fn candidate(&self) -> String;
}

const ADJECTIVES: &[&str] = &[
    "admiring", "adoring", "affectionate", "agitated", "amazing", "angry", "awesome",
    "beautiful", "blissful", "bold", "brave", "busy", "charming", "clever", "cool",
    "compassionate", "competent", "condescending", "confident", "cranky", "crazy",
    "dazzling", "determined", "distracted", "dreamy", "eager", "ecstatic", "elastic",
    "elated", "elegant", "eloquent", "epic", "exciting", "fervent", "festive", "flamboyant",
    "focused", "friendly", "frosty", "funny", "gallant", "gifted", "goofy", "gracious",
    "great", "happy", "hardcore", "heuristic", "hopeful", "hungry", "infallible",
    "inspiring", "intelligent", "interesting", "jolly", "jovial", "keen", "kind",
    "laughing", "loving", "lucid", "magical", "modest", "musing", "mystifying", "naughty",
    "nervous", "nice", "nifty", "nostalgic", "objective", "optimistic", "peaceful",
    "pedantic", "pensive", "practical", "priceless", "quirky", "quizzical", "recursing",
    "relaxed", "reverent", "romantic", "sad", "serene", "sharp", "silly", "sleepy",
    "stoic", "strange", "stupefied", "suspicious", "sweet", "tender", "thirsty",
    "trusting", "unruffled", "upbeat", "vibrant", "vigilant", "vigorous", "wizardly",
    "wonderful", "xenodochial", "youthful", "zealous", "zen",
];

const SURNAMES: &[&str] = &[
    "albattani", "allen", "almeida", "archimedes", "ardinghelli", "aryabhata", "austin",
    "babbage", "banach", "bardeen", "bartik", "bassi", "bell", "benz", "bhabha",
    "blackwell", "bohr", "booth", "borg", "bose", "boyd", "brahmagupta", "brattain",
    "brown", "carson", "cerf", "chandrasekhar", "clarke", "colden", "cori", "cray",
    "curie", "darwin", "davinci", "diffie", "dijkstra", "dubinsky", "easley", "einstein",
    "elbakyan", "elgamal", "elion", "engelbart", "euclid", "euler", "faraday", "fermat",
    "fermi", "feynman", "franklin", "galileo", "gates", "goldberg", "goldstine",
    "goldwasser", "goodall", "hamilton", "hawking", "heisenberg", "hellman", "hermann",
    "hodgkin", "hofstadter", "hoover", "hopper", "hugle", "hypatia", "jackson", "jang",
    "jennings", "jepsen", "johnson", "joliot", "jones", "kalam", "kapitsa", "keller",
    "kepler", "khorana", "kilby", "kirch", "knuth", "kowalevski", "lalande", "lamarr",
    "lamport", "leakey", "leavitt", "lederberg", "lehmann", "lewin", "lichterman",
    "liskov", "lovelace", "lumiere", "mahavira", "margulis", "matsumoto", "maxwell",
    "mayer", "mccarthy", "mcclintock", "meitner", "merkle", "mirzakhani", "montalcini",
    "moore", "morse", "murdock", "napier", "nash", "neumann", "newton", "nightingale",
    "nobel", "noether", "northcutt", "noyce", "pare", "pascal", "pasteur", "payne",
    "perlman", "pike", "poincare", "poitras", "ptolemy", "raman", "ramanujan", "ride",
    "ritchie", "rhodes", "robinson", "roentgen", "rosalind", "rubin", "saha", "sammet",
    "shamir", "shannon", "shaw", "shirley", "shockley", "sinoussi", "snyder", "solomon",
    "spence", "stonebraker", "sutherland", "swanson", "swartz", "swirles", "taussig",
    "tesla", "tharp", "thompson", "torvalds", "turing", "varahamihira", "visvesvaraya",
    "volhard", "villani", "wescoff", "wiles", "williams", "wilson", "wing", "wozniak",
    "wright", "wu", "yalow", "yonath", "zhukovsky",
];

/// Random `adjective-surname` generator
#[derive(Debug, Default, Clone, Copy)]
pub struct WordPairGenerator;

impl WordPairGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl NameGenerator for WordPairGenerator {
    fn candidate(&self) -> String {
        let mut rng = rand::thread_rng();
        // Both lists are non-empty constants
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("zen");
        let surname = SURNAMES.choose(&mut rng).copied().unwrap_or("turing");

        format!("{}-{}", adjective, surname)
    }
}

/// True if `label` is a valid single DNS label (RFC 1123)
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
