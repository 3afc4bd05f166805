use anyhow::Result;
use log::info;
use tch::Device;

use lmkit::generate::{Generator, GeneratorConfig};
use lmkit::hub::auto::AutoCausalLM;
use lmkit::hub::fetch::{Hub, LocalDirHub};
use lmkit::sampler::Sampler;
use lmkit::tokenization::roberta::RobertaTokenizer;
use lmkit::tokenization::tokenizer::Tokenizer;

/// Load a causal LM from a local checkpoint directory and decode a
/// continuation for the prompt given on the command line.
///
/// Usage: `lmkit <models-root> <model-name> [prompt]`
fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let root = args.next().unwrap_or_else(|| "models".to_string());
    let name = args.next().unwrap_or_else(|| "llama".to_string());
    let prompt = args.next().unwrap_or_else(|| "Hello".to_string());

    let hub = LocalDirHub::new(&root);
    info!("fetching {name} from {root}");
    let tokenizer_json = hub
        .fetch(&name, "main")?
        .tokenizer_json
        .ok_or_else(|| anyhow::anyhow!("{name} ships no tokenizer.json"))?;
    let tokenizer = RobertaTokenizer::from_hf_tokenizer_json(&tokenizer_json)?;

    let model = AutoCausalLM::from_hub(&hub, &name, "main", Device::Cpu, None)?;
    info!("model ready: {:?}", model.config().family);

    let encoding = tokenizer.encode(&[prompt.as_str()])?;
    let mut generator = Generator::new(&model, Sampler::new(0.8, 0.95, 42));
    let generated = generator.generate(
        &encoding.ids[0],
        &GeneratorConfig {
            max_new_pieces: 64,
            eos_id: None,
        },
    )?;

    let text = tokenizer.decode(&[generated])?;
    println!("{}{}", prompt, text[0]);
    Ok(())
}
