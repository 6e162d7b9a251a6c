use anyhow::{bail, Result};
use std::fmt::Display;
use std::io::{BufRead, Write};

pub(crate) const SD_CARD_PROMPT: &str = "Which device is your SD card (boot card for the Pi)?";
pub(crate) const THUMB_DRIVE_PROMPT: &str =
    "Which device is your USB thumb drive (this becomes the Pi's root partition)?";

pub(crate) struct Prompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub(crate) fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub(crate) fn output(&mut self) -> &mut W {
        &mut self.output
    }

    /// Asks until the answer is one of the option keys or its 1-based
    /// position. The chosen option is removed from `options`.
    pub(crate) fn ask<T: Display>(&mut self, prompt: &str, options: &mut Vec<(String, T)>) -> Result<T> {
        if options.is_empty() {
            bail!("nothing left to choose for: {}", prompt);
        }
        writeln!(self.output, "{}", prompt)?;
        for (index, (key, value)) in options.iter().enumerate() {
            writeln!(self.output, "  {}) {} -- {}", index + 1, key, value)?;
        }
        loop {
            let answer = self.read_answer()?;
            let position = options.iter().position(|(key, _)| *key == answer).or_else(|| {
                answer
                    .parse::<usize>()
                    .ok()
                    .filter(|index| (1..=options.len()).contains(index))
                    .map(|index| index - 1)
            });
            match position {
                Some(position) => {
                    let (key, value) = options.remove(position);
                    writeln!(self.output, "You chose: {} -- {}", key, value)?;
                    return Ok(value);
                }
                None => writeln!(self.output, "That's not a valid option, try again.")?,
            }
        }
    }

    /// Non-empty free-form answer.
    pub(crate) fn freestyle(&mut self, prompt: &str) -> Result<String> {
        loop {
            writeln!(self.output, "{}", prompt)?;
            let answer = self.read_answer()?;
            if !answer.is_empty() {
                return Ok(answer);
            }
        }
    }

    pub(crate) fn confirm(&mut self, prompt: &str) -> Result<bool> {
        loop {
            write!(self.output, "{} [Y/n] ", prompt)?;
            self.output.flush()?;
            match self.read_line()?.trim() {
                "Y" => return Ok(true),
                "n" => return Ok(false),
                _ => writeln!(self.output, "Please answer Y or n.")?,
            }
        }
    }

    /// Picks the SD card, then the thumb drive from what is left.
    pub(crate) fn devices_prompt<T: Display>(&mut self, mut devices: Vec<(String, T)>) -> Result<(T, T)> {
        let sd_card = self.ask(SD_CARD_PROMPT, &mut devices)?;
        writeln!(self.output)?;
        let thumb_drive = self.ask(THUMB_DRIVE_PROMPT, &mut devices)?;
        writeln!(self.output)?;
        Ok((sd_card, thumb_drive))
    }

    fn read_answer(&mut self) -> Result<String> {
        write!(self.output, "--> ")?;
        self.output.flush()?;
        Ok(self.read_line()?.trim().to_string())
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            bail!("input closed");
        }
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn prompter(input: &str) -> Prompter<Cursor<Vec<u8>>, Vec<u8>> {
        Prompter::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    fn options() -> Vec<(String, String)> {
        vec![
            ("mmcblk0".to_string(), "mmcblk0 mmcblk0 29GB".to_string()),
            ("sdb".to_string(), "SanDisk Cruzer Fit 14GB".to_string()),
            ("sdc".to_string(), "Generic Flash Disk 7GB".to_string()),
        ]
    }

    #[test]
    fn ask_repeats_until_valid_and_removes_choice() {
        let mut prompt = prompter("sdz\nsdb\n");
        let mut options = options();
        let chosen = prompt.ask("Pick one", &mut options).unwrap();
        assert_eq!(chosen, "SanDisk Cruzer Fit 14GB");
        assert_eq!(options.len(), 2);
        let out = String::from_utf8(prompt.output().clone()).unwrap();
        assert!(out.contains("  2) sdb -- SanDisk Cruzer Fit 14GB"));
        assert!(out.contains("not a valid option"));
    }

    #[test]
    fn ask_accepts_position() {
        let mut prompt = prompter("3\n");
        let mut options = options();
        assert_eq!(prompt.ask("Pick one", &mut options).unwrap(), "Generic Flash Disk 7GB");
    }

    #[test]
    fn devices_prompt_never_offers_the_same_device_twice() {
        let mut prompt = prompter("mmcblk0\nmmcblk0\n1\n");
        let (sd, thumb) = prompt.devices_prompt(options()).unwrap();
        assert_eq!(sd, "mmcblk0 mmcblk0 29GB");
        assert_eq!(thumb, "SanDisk Cruzer Fit 14GB");
    }

    #[test]
    fn confirm_is_case_sensitive_like_the_prompt() {
        assert!(prompter("y\nY\n").confirm("Are you sure?").unwrap());
        assert!(!prompter("n\n").confirm("Are you sure?").unwrap());
    }

    #[test]
    fn closed_input_is_an_error() {
        assert!(prompter("").confirm("Are you sure?").is_err());
        assert!(prompter("\n\n").freestyle("Desired username:").is_err());
        assert_eq!(prompter("\nalice\n").freestyle("Desired username:").unwrap(), "alice");
    }
}
